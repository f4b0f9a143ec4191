//! `peerdrop send`: publish a share, wait for a receiver, push the file.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::args::Args;
use super::link::{Link, Service};
use super::progress;
use crate::core::config::TransferConfig;
use crate::core::connection::{ConnectionNegotiator, Role, TransportChannel};
use crate::core::error::TransferError;
use crate::core::pipeline::chunk::{FileSource, chunk_count};
use crate::core::security::pin::hash_pin;
use crate::core::session::{Direction, FileDescriptor, SessionManager};
use crate::core::signaling::{SenderFlags, ShareRecord};
use crate::utils::sos::SignalOfStop;

pub async fn run(args: &Args, file: &Path, pin: Option<&str>, stop: SignalOfStop) -> Result<()> {
    let config = args.transfer.clone();
    // Size check happens before anything is published.
    let descriptor = describe_file(file, &config).await?;

    let service = Service::connect(args.server()).await?;
    let gathered = service.sample_candidates().await;
    let (probe, params) = service
        .negotiation_params(false, gathered.as_deref(), &config)
        .await;

    let manager = SessionManager::new(stop.clone(), config.clone());
    let transfer_id = Uuid::new_v4();
    let session = manager
        .create(transfer_id, Direction::Outbound, descriptor.clone())
        .await;

    let (negotiator, mut negotiator_events) = ConnectionNegotiator::new(
        Role::Offerer,
        params,
        service.ice.servers.clone(),
        config.buffered_low,
    );
    let offer = negotiator.create_offer().await?;

    let record = ShareRecord {
        transfer_id,
        offer,
        file_name: descriptor.name.clone(),
        file_size: descriptor.byte_size,
        pin_hash: pin.map(|p| hash_pin(&transfer_id, p)),
        sender_flags: SenderFlags {
            restrictive_network: probe.restrictive,
            relay_only: params.relay_only,
            trickle: params.trickle,
        },
        sender_id: service.client.peer_id().to_string(),
    };
    let share_id = service.client.publish_share(&record).await?;
    info!(event = "share_published", %share_id, transfer_id = %transfer_id);
    println!("Share id: {share_id}");
    if pin.is_some() {
        println!("The receiver will need the PIN.");
    }
    println!("Waiting for a receiver... (Ctrl-C to stop)");

    let poll_stop = stop.child();
    let (mut inbox, poller) = service.client.spawn_poller(poll_stop.clone(), config.poll_lifetime);
    let established = Link {
        negotiator: &negotiator,
        events: &mut negotiator_events,
        client: &service.client,
        inbox: &mut inbox,
        peer: None,
        relay_available: service.relay_available(),
    }
    .establish(session.stop_signal())
    .await;
    poll_stop.cancel();
    let _ = poller.await;

    let (channel, channel_events) = match established {
        Ok(open) => open,
        Err(e) => {
            session.finish_with(e.clone()).await;
            negotiator.close().await;
            eprintln!("{}", progress::summary(&session.snapshot().await));
            return Err(e.into());
        }
    };

    let display = progress::spawn_display(manager.clone(), stop.child());
    let channel: Arc<dyn TransportChannel> = channel;
    let result = session
        .send_file(channel, channel_events, FileSource::Path(file.to_path_buf()))
        .await;
    let _ = display.await;
    negotiator.close().await;

    let transfer = session.snapshot().await;
    eprintln!("{}", progress::summary(&transfer));
    manager.close_all().await;
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancellation() => {
            warn!(event = "send_cancelled", error = %e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Build the descriptor for a file on disk, enforcing the size limit.
pub async fn describe_file(path: &Path, config: &TransferConfig) -> Result<FileDescriptor> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    anyhow::ensure!(meta.is_file(), "{} is not a regular file", path.display());

    let byte_size = meta.len();
    if byte_size > config.max_file_size {
        return Err(TransferError::FileTooLarge {
            size: byte_size,
            limit: config.max_file_size,
        }
        .into());
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("path has no file name")?;
    let last_modified = meta
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
        .unwrap_or_default();

    Ok(FileDescriptor {
        mime_type: mime_for(&name).to_string(),
        chunk_count: chunk_count(byte_size, config.chunk_size)?,
        name,
        byte_size,
        last_modified,
    })
}

/// Best-effort media type from the extension.
fn mime_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for("Report.PDF"), "application/pdf");
        assert_eq!(mime_for("notes.txt"), "text/plain");
        assert_eq!(mime_for("README"), "application/octet-stream");
    }

    #[tokio::test]
    async fn describes_file_on_disk() {
        let dir = std::env::temp_dir().join(format!("peerdrop-send-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("data.bin");
        tokio::fs::write(&path, vec![7u8; 2500]).await.unwrap();

        let config = TransferConfig {
            chunk_size: 1024,
            ..Default::default()
        };
        let d = describe_file(&path, &config).await.unwrap();
        assert_eq!(d.name, "data.bin");
        assert_eq!(d.byte_size, 2500);
        assert_eq!(d.chunk_count, 3);
        assert!(d.last_modified > 0);

        let tight = TransferConfig {
            max_file_size: 100,
            ..Default::default()
        };
        let err = describe_file(&path, &tight).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::FileTooLarge { size: 2500, limit: 100 })
        ));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let dir = std::env::temp_dir();
        assert!(describe_file(&dir, &TransferConfig::default()).await.is_err());
    }
}
