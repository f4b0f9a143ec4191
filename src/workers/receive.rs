//! `peerdrop receive`: look up a share, answer its offer, save the file.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::args::Args;
use super::link::{Link, Service};
use super::progress::{self, TerminalGate};
use crate::core::connection::{ConnectionNegotiator, Role, TransportChannel};
use crate::core::error::TransferError;
use crate::core::pipeline::chunk::chunk_count;
use crate::core::security::advisor::ApprovalPolicy;
use crate::core::security::pin::verify_pin;
use crate::core::session::{Direction, DirectorySink, FileDescriptor, SessionManager};
use crate::core::signaling::{ShareId, ShareRecord, SignalKind};
use crate::utils::sos::SignalOfStop;

pub struct ReceiveOptions {
    pub short_id: String,
    pub pin: Option<String>,
    pub out: Option<PathBuf>,
    pub auto_approve: bool,
}

pub async fn run(args: &Args, opts: ReceiveOptions, stop: SignalOfStop) -> Result<()> {
    let config = args.transfer.clone();
    let share_id = ShareId::parse(&opts.short_id)?;
    let service = Service::connect(args.server()).await?;

    let record = service
        .client
        .fetch_share(&share_id)
        .await
        .with_context(|| format!("share {share_id} is not available"))?;
    info!(
        event = "share_fetched",
        %share_id,
        transfer_id = %record.transfer_id,
        name = %record.file_name,
        bytes = record.file_size,
    );

    if record.file_size > config.max_file_size {
        return Err(TransferError::FileTooLarge {
            size: record.file_size,
            limit: config.max_file_size,
        }
        .into());
    }
    check_pin(&record, opts.pin).await?;
    let provisional = provisional_descriptor(&record, config.chunk_size)?;

    let gathered = service.sample_candidates().await;
    let (_, mut params) = service
        .negotiation_params(
            record.sender_flags.restrictive_network,
            gathered.as_deref(),
            &config,
        )
        .await;
    if record.sender_flags.relay_only && service.relay_available() {
        params.relay_only = true;
    }

    let manager = SessionManager::new(stop.clone(), config.clone());
    let session = manager
        .create(
            record.transfer_id,
            Direction::Inbound,
            provisional,
        )
        .await;

    let (negotiator, mut negotiator_events) = ConnectionNegotiator::new(
        Role::Answerer,
        params,
        service.ice.servers.clone(),
        config.buffered_low,
    );

    let hello = serde_json::json!({
        "transferId": record.transfer_id,
        "peerId": service.client.peer_id(),
    })
    .to_string();
    service
        .client
        .send(SignalKind::PeerInfo, &record.sender_id, hello)
        .await?;

    let poll_stop = stop.child();
    let (mut inbox, poller) = service.client.spawn_poller(poll_stop.clone(), config.poll_lifetime);

    let established = match negotiator.accept_offer(&record.offer).await {
        Ok(answer) => {
            if let Err(e) = service
                .client
                .send(SignalKind::Answer, &record.sender_id, answer)
                .await
            {
                warn!(event = "answer_send_failed", error = %e, "Answer not delivered");
            }
            Link {
                negotiator: &negotiator,
                events: &mut negotiator_events,
                client: &service.client,
                inbox: &mut inbox,
                peer: Some(record.sender_id.clone()),
                relay_available: service.relay_available(),
            }
            .establish(session.stop_signal())
            .await
        }
        Err(e) => {
            warn!(event = "offer_rejected", error = %e);
            Err(TransferError::Negotiation)
        }
    };
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

    let out_dir = opts.out.unwrap_or_else(|| PathBuf::from("."));
    let policy = if opts.auto_approve {
        ApprovalPolicy::AutoApprove
    } else {
        ApprovalPolicy::AnyAdvisory
    };

    let display = progress::spawn_display(manager.clone(), stop.child());
    let channel: Arc<dyn TransportChannel> = channel;
    let result = session
        .receive_file(
            channel,
            channel_events,
            Arc::new(DirectorySink::new(out_dir)),
            policy,
            Arc::new(TerminalGate),
        )
        .await;
    let _ = display.await;
    negotiator.close().await;

    eprintln!("{}", progress::summary(&session.snapshot().await));
    manager.close_all().await;
    match result {
        Ok(outcome) => {
            if let Some(path) = outcome.saved.path {
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            warn!(event = "receive_cancelled", error = %e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Check the PIN before any connection attempt. Prompts when the share
/// needs one and none was given.
async fn check_pin(record: &ShareRecord, given: Option<String>) -> Result<()> {
    let Some(stored) = &record.pin_hash else {
        return Ok(());
    };
    let entered = match given {
        Some(pin) => pin,
        None => progress::read_line("PIN: ".to_string()).await?,
    };
    if !verify_pin(&record.transfer_id, &entered, stored) {
        warn!(event = "pin_mismatch", transfer_id = %record.transfer_id);
        bail!("incorrect PIN");
    }
    Ok(())
}

/// What is known about the file before its metadata arrives.
fn provisional_descriptor(
    record: &ShareRecord,
    chunk_size: usize,
) -> Result<FileDescriptor, TransferError> {
    Ok(FileDescriptor {
        name: record.file_name.clone(),
        byte_size: record.file_size,
        mime_type: "application/octet-stream".into(),
        last_modified: 0,
        chunk_count: chunk_count(record.file_size, chunk_size)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::pin::hash_pin;
    use crate::core::signaling::SenderFlags;
    use uuid::Uuid;

    fn record(pin: Option<&str>) -> ShareRecord {
        let transfer_id = Uuid::new_v4();
        ShareRecord {
            transfer_id,
            offer: "v=0".into(),
            file_name: "photo.jpg".into(),
            file_size: 3000,
            pin_hash: pin.map(|p| hash_pin(&transfer_id, p)),
            sender_flags: SenderFlags::default(),
            sender_id: "sender".into(),
        }
    }

    #[tokio::test]
    async fn pin_checked_before_connecting() {
        assert!(check_pin(&record(None), None).await.is_ok());
        assert!(check_pin(&record(Some("1234")), Some("1234".into())).await.is_ok());
        assert!(check_pin(&record(Some("1234")), Some(" 1234 ".into())).await.is_ok());
        let err = check_pin(&record(Some("1234")), Some("9999".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "incorrect PIN");
    }

    #[test]
    fn provisional_descriptor_uses_local_chunk_size() {
        let d = provisional_descriptor(&record(None), 1024).unwrap();
        assert_eq!(d.name, "photo.jpg");
        assert_eq!(d.byte_size, 3000);
        assert_eq!(d.chunk_count, 3);
    }

    #[test]
    fn oversized_chunk_count_is_rejected_up_front() {
        let mut r = record(None);
        r.file_size = u64::from(u32::MAX) + 1;
        assert!(matches!(
            provisional_descriptor(&r, 1),
            Err(TransferError::Validation(_))
        ));
    }
}
