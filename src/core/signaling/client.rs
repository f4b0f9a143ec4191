//! Peer-facing signaling client: publishes shares, sends envelopes, and
//! polls this peer's mailbox with exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    IceServerList, ShareId, ShareRecord, SignalKind, SignalingBackend, SignalingEnvelope,
    SignalingError,
};
use crate::core::config::{POLL_EMPTY_STREAK, POLL_INTERVAL_MAX, POLL_INTERVAL_MIN};
use crate::utils::sos::SignalOfStop;

/// Poll interval schedule.
///
/// Starts at `min`; after `streak` consecutive empty polls the interval
/// doubles on every further empty poll up to `max`. Any poll that delivers
/// something resets it.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    streak: u32,
    empty_polls: u32,
    current: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(POLL_INTERVAL_MIN, POLL_INTERVAL_MAX, POLL_EMPTY_STREAK)
    }
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration, streak: u32) -> Self {
        Self {
            min,
            max,
            streak,
            empty_polls: 0,
            current: min,
        }
    }

    /// Record one poll outcome and return the delay before the next poll.
    pub fn record(&mut self, delivered: bool) -> Duration {
        if delivered {
            self.empty_polls = 0;
            self.current = self.min;
        } else {
            self.empty_polls = self.empty_polls.saturating_add(1);
            if self.empty_polls > self.streak {
                self.current = (self.current * 2).min(self.max);
            }
        }
        self.current
    }
}

/// Signaling endpoint for one local peer id.
#[derive(Clone)]
pub struct SignalingClient {
    backend: Arc<dyn SignalingBackend>,
    peer_id: String,
}

impl SignalingClient {
    /// A client with a fresh random peer id.
    pub fn new(backend: Arc<dyn SignalingBackend>) -> Self {
        Self::with_peer_id(backend, Uuid::new_v4().to_string())
    }

    pub fn with_peer_id(backend: Arc<dyn SignalingBackend>, peer_id: impl Into<String>) -> Self {
        Self {
            backend,
            peer_id: peer_id.into(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn publish_share(&self, record: &ShareRecord) -> Result<ShareId, SignalingError> {
        record.validate()?;
        let id = self.backend.create_share(record).await?;
        info!(
            event = "share_published",
            share_id = %id,
            transfer_id = %record.transfer_id,
            pin = record.requires_pin(),
        );
        Ok(id)
    }

    /// Fetch a share record, rejecting it if it comes back incomplete.
    pub async fn fetch_share(&self, id: &ShareId) -> Result<ShareRecord, SignalingError> {
        let record = self.backend.fetch_share(id).await?;
        record.validate()?;
        Ok(record)
    }

    pub async fn update_pin(&self, id: &ShareId, pin_hash: Option<String>) -> Result<(), SignalingError> {
        self.backend.update_pin(id, pin_hash).await
    }

    pub async fn ice_servers(&self) -> Result<IceServerList, SignalingError> {
        self.backend.ice_servers().await
    }

    /// Post one envelope from this peer to `receiver_id`.
    pub async fn send(
        &self,
        kind: SignalKind,
        receiver_id: &str,
        payload: String,
    ) -> Result<(), SignalingError> {
        let envelope = SignalingEnvelope {
            kind,
            sender_id: self.peer_id.clone(),
            receiver_id: receiver_id.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        envelope.validate()?;
        self.backend.post(&envelope).await?;
        debug!(event = "signal_sent", %kind, receiver_id);
        Ok(())
    }

    /// Poll this peer's mailbox until `stop` fires, the receiver is dropped,
    /// or `lifetime` runs out.
    ///
    /// Failed polls are logged and retried on the backoff schedule. An
    /// envelope identical to one already delivered is dropped, so callers
    /// see each distinct offer/answer/candidate once.
    pub fn spawn_poller(
        &self,
        stop: SignalOfStop,
        lifetime: Duration,
    ) -> (mpsc::UnboundedReceiver<SignalingEnvelope>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = self.backend.clone();
        let peer_id = self.peer_id.clone();

        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + lifetime;
            let mut backoff = PollBackoff::default();
            let mut seen: HashSet<(SignalKind, String, String)> = HashSet::new();

            let reason = loop {
                if stop.cancelled() {
                    break "cancelled";
                }
                if tx.is_closed() {
                    break "receiver_dropped";
                }
                let now = Instant::now();
                if now >= deadline {
                    break "lifetime_elapsed";
                }

                let delivered = match backend.drain(&peer_id).await {
                    Ok(envelopes) => {
                        let mut fresh = 0usize;
                        for env in envelopes {
                            if let Err(e) = env.validate() {
                                warn!(event = "signal_malformed", error = %e, "Dropping malformed envelope");
                                continue;
                            }
                            let key = (env.kind, env.sender_id.clone(), env.payload.clone());
                            if !seen.insert(key) {
                                debug!(event = "signal_duplicate", kind = %env.kind, "Dropping duplicate envelope");
                                continue;
                            }
                            fresh += 1;
                            let _ = tx.send(env);
                        }
                        fresh > 0
                    }
                    Err(e) => {
                        warn!(event = "signal_poll_failed", error = %e, "Mailbox poll failed, retrying");
                        false
                    }
                };

                let delay = backoff
                    .record(delivered)
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::select! {
                    _ = stop.wait() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            };

            info!(event = "signal_poll_stopped", %peer_id, reason);
        });

        (rx, handle)
    }
}
