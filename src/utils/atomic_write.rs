//! Atomic file write utility.
//!
//! Received files are written to a `.part` sibling first and then renamed
//! over the target, so an interrupted save never leaves a truncated file
//! under the final name.
//!
//! Note: `rename()` is atomic on NTFS, ext4, APFS, and all major filesystems
//! when source and destination are on the same mount.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::error;

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
/// Returns an error if the temp file cannot be written or the rename fails.
/// On rename failure, attempts to clean up the temp file.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp_path = part_path(path);

    if let Err(e) = tokio::fs::write(&tmp_path, content).await {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("writing {}", tmp_path.display()));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("renaming to {}", path.display()));
    }

    Ok(())
}

/// Pick a path inside `dir` for `name` that does not exist yet.
///
/// `report.pdf` becomes `report (1).pdf`, `report (2).pdf`, … when taken.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    (1u32..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn part_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}
