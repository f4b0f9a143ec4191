//! `peerdrop pin`: attach, change or clear the PIN of a share that is
//! already published.

use anyhow::{Context, Result, bail};
use tracing::info;

use super::args::Args;
use super::link::Service;
use super::progress;
use crate::core::security::pin::hash_pin;
use crate::core::signaling::ShareId;
use crate::core::signaling::client::SignalingClient;

pub async fn run(args: &Args, short_id: &str, pin: Option<String>, clear: bool) -> Result<()> {
    let share_id = ShareId::parse(short_id)?;
    let pin = if clear {
        None
    } else {
        match pin {
            Some(pin) => Some(pin),
            None => Some(progress::read_line("New PIN: ".to_string()).await?),
        }
    };

    let service = Service::connect(args.server()).await?;
    apply_pin(&service.client, &share_id, pin.as_deref()).await?;
    match pin {
        Some(_) => println!("PIN set for {share_id}"),
        None => println!("PIN cleared for {share_id}"),
    }
    Ok(())
}

/// Replace the share's PIN hash. The salt is the transfer id, so the
/// record is fetched first.
async fn apply_pin(client: &SignalingClient, share_id: &ShareId, pin: Option<&str>) -> Result<()> {
    if pin.is_some_and(|p| p.trim().is_empty()) {
        bail!("PIN must not be empty");
    }
    let record = client
        .fetch_share(share_id)
        .await
        .with_context(|| format!("share {share_id} is not available"))?;
    let pin_hash = pin.map(|p| hash_pin(&record.transfer_id, p));
    client.update_pin(share_id, pin_hash).await?;
    info!(event = "pin_updated", %share_id, pin = pin.is_some());
    Ok(())
}
