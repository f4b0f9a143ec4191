//! Destination for a reassembled file.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tracing::info;

use super::state::FileDescriptor;
use crate::utils::atomic_write::{atomic_write, unique_destination};
use crate::utils::sanitize::sanitize_file_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Where the file ended up, for sinks backed by a filesystem.
    pub path: Option<PathBuf>,
    pub byte_size: u64,
}

#[async_trait]
pub trait FileSink: Send + Sync {
    async fn save(&self, file: &FileDescriptor, content: Bytes) -> Result<SavedFile>;
}

/// Saves into a directory under the sanitized advertised name, never
/// overwriting an existing file.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn save(&self, file: &FileDescriptor, content: Bytes) -> Result<SavedFile> {
        let name = sanitize_file_name(&file.name);
        let path = unique_destination(&self.dir, &name);
        atomic_write(&path, &content).await?;
        info!(
            event = "file_saved",
            path = %path.display(),
            bytes = content.len(),
            "File saved"
        );
        Ok(SavedFile {
            path: Some(path),
            byte_size: content.len() as u64,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            byte_size: 5,
            mime_type: "text/plain".into(),
            last_modified: 0,
            chunk_count: 1,
        }
    }

    #[tokio::test]
    async fn directory_sink_sanitizes_and_never_overwrites() {
        let dir = std::env::temp_dir().join(format!("peerdrop-sink-{}", uuid::Uuid::new_v4()));
        let sink = DirectorySink::new(&dir);

        let first = sink
            .save(&descriptor("../../etc/notes.txt"), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let second = sink
            .save(&descriptor("notes.txt"), Bytes::from_static(b"world"))
            .await
            .unwrap();

        assert_eq!(first.path.as_deref(), Some(dir.join("notes.txt").as_path()));
        assert_eq!(second.path.as_deref(), Some(dir.join("notes (1).txt").as_path()));
        assert_eq!(tokio::fs::read(dir.join("notes.txt")).await.unwrap(), b"hello");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
