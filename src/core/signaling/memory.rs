//! In-process signaling backend.
//!
//! Implements the same contract as the HTTP service (TTL expiry, destructive
//! reads) on top of two maps. Expired entries are pruned on every write.
//! Expiry uses `tokio::time::Instant`, so tests can fast-forward it with a
//! paused clock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    IceServerList, ShareId, ShareRecord, SignalingBackend, SignalingEnvelope, SignalingError,
};
use crate::core::config::{ENVELOPE_TTL, SHARE_RECORD_TTL};

#[derive(Default)]
struct State {
    shares: HashMap<ShareId, (ShareRecord, Instant)>,
    mailboxes: HashMap<String, Vec<(SignalingEnvelope, Instant)>>,
}

impl State {
    /// Forget expired shares and envelopes; mailboxes left empty go too.
    fn prune(&mut self, now: Instant) {
        self.shares.retain(|_, (_, expires_at)| now < *expires_at);
        self.mailboxes.retain(|_, queue| {
            queue.retain(|(_, expires_at)| now < *expires_at);
            !queue.is_empty()
        });
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    share_ttl: Duration,
    envelope_ttl: Duration,
    ice: IceServerList,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            share_ttl: SHARE_RECORD_TTL,
            envelope_ttl: ENVELOPE_TTL,
            ice: IceServerList::default(),
        }
    }

    /// Envelopes currently queued for `receiver_id`, without consuming them.
    #[cfg(test)]
    pub async fn pending(&self, receiver_id: &str) -> usize {
        self.state
            .lock()
            .await
            .mailboxes
            .get(receiver_id)
            .map_or(0, Vec::len)
    }

    #[cfg(test)]
    async fn mailbox_count(&self) -> usize {
        self.state.lock().await.mailboxes.len()
    }
}

#[async_trait]
impl SignalingBackend for MemoryBackend {
    async fn create_share(&self, record: &ShareRecord) -> Result<ShareId, SignalingError> {
        record.validate()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        let mut id = ShareId::generate();
        while state.shares.contains_key(&id) {
            id = ShareId::generate();
        }
        state
            .shares
            .insert(id.clone(), (record.clone(), now + self.share_ttl));
        Ok(id)
    }

    async fn fetch_share(&self, id: &ShareId) -> Result<ShareRecord, SignalingError> {
        let mut state = self.state.lock().await;
        let Some((record, expires_at)) = state.shares.get(id) else {
            return Err(SignalingError::NotFound);
        };
        if Instant::now() >= *expires_at {
            state.shares.remove(id);
            return Err(SignalingError::Expired);
        }
        Ok(record.clone())
    }

    async fn update_pin(&self, id: &ShareId, pin_hash: Option<String>) -> Result<(), SignalingError> {
        let mut state = self.state.lock().await;
        match state.shares.get_mut(id) {
            Some((_, expires_at)) if Instant::now() >= *expires_at => Err(SignalingError::Expired),
            Some((record, _)) => {
                record.pin_hash = pin_hash;
                record.validate()
            }
            None => Err(SignalingError::NotFound),
        }
    }

    async fn post(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        envelope.validate()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        state
            .mailboxes
            .entry(envelope.receiver_id.clone())
            .or_default()
            .push((envelope.clone(), now + self.envelope_ttl));
        Ok(())
    }

    async fn drain(&self, receiver_id: &str) -> Result<Vec<SignalingEnvelope>, SignalingError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let queued = state.mailboxes.remove(receiver_id).unwrap_or_default();
        Ok(queued
            .into_iter()
            .filter(|(_, expires_at)| now < *expires_at)
            .map(|(env, _)| env)
            .collect())
    }

    async fn ice_servers(&self) -> Result<IceServerList, SignalingError> {
        Ok(self.ice.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signaling::{SenderFlags, SignalKind};
    use uuid::Uuid;

    fn record() -> ShareRecord {
        ShareRecord {
            transfer_id: Uuid::new_v4(),
            offer: "offer-sdp".into(),
            file_name: "a.bin".into(),
            file_size: 10,
            pin_hash: None,
            sender_flags: SenderFlags::default(),
            sender_id: "s".into(),
        }
    }

    fn envelope(kind: SignalKind, to: &str) -> SignalingEnvelope {
        SignalingEnvelope {
            kind,
            sender_id: "s".into(),
            receiver_id: to.into(),
            payload: "{}".into(),
            timestamp: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn share_expires_after_ttl() {
        let backend = MemoryBackend::new();
        let id = backend.create_share(&record()).await.unwrap();
        assert!(backend.fetch_share(&id).await.is_ok());

        tokio::time::advance(SHARE_RECORD_TTL + Duration::from_secs(1)).await;
        assert!(matches!(backend.fetch_share(&id).await, Err(SignalingError::Expired)));
    }

    #[tokio::test]
    async fn unknown_share_is_not_found() {
        let backend = MemoryBackend::new();
        let id = ShareId::parse("nope1234").unwrap();
        assert!(matches!(backend.fetch_share(&id).await, Err(SignalingError::NotFound)));
        assert!(matches!(backend.update_pin(&id, None).await, Err(SignalingError::NotFound)));
    }

    #[tokio::test]
    async fn update_pin_replaces_hash() {
        let backend = MemoryBackend::new();
        let id = backend.create_share(&record()).await.unwrap();
        backend.update_pin(&id, Some("b".repeat(64))).await.unwrap();
        assert!(backend.fetch_share(&id).await.unwrap().requires_pin());
        backend.update_pin(&id, None).await.unwrap();
        assert!(!backend.fetch_share(&id).await.unwrap().requires_pin());
    }

    #[tokio::test]
    async fn drain_is_destructive() {
        let backend = MemoryBackend::new();
        backend.post(&envelope(SignalKind::Answer, "r")).await.unwrap();
        backend.post(&envelope(SignalKind::Candidate, "r")).await.unwrap();
        backend.post(&envelope(SignalKind::Candidate, "other")).await.unwrap();

        let first = backend.drain("r").await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].kind, SignalKind::Answer);
        assert!(backend.drain("r").await.unwrap().is_empty());
        assert_eq!(backend.pending("other").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_envelopes_are_discarded() {
        let backend = MemoryBackend::new();
        backend.post(&envelope(SignalKind::Offer, "r")).await.unwrap();
        tokio::time::advance(ENVELOPE_TTL + Duration::from_secs(1)).await;
        assert!(backend.drain("r").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_mailboxes_are_pruned() {
        let backend = MemoryBackend::new();
        backend.post(&envelope(SignalKind::Offer, "gone")).await.unwrap();
        backend.post(&envelope(SignalKind::Offer, "r")).await.unwrap();
        assert_eq!(backend.mailbox_count().await, 2);

        backend.drain("r").await.unwrap();
        assert_eq!(backend.mailbox_count().await, 1);

        tokio::time::advance(ENVELOPE_TTL + Duration::from_secs(1)).await;
        backend.post(&envelope(SignalKind::Answer, "r")).await.unwrap();
        assert_eq!(backend.mailbox_count().await, 1);
        assert_eq!(backend.pending("gone").await, 0);
        assert_eq!(backend.pending("r").await, 1);
    }

    #[tokio::test]
    async fn malformed_input_is_rejected() {
        let backend = MemoryBackend::new();
        let mut bad = record();
        bad.file_name = String::new();
        assert!(matches!(
            backend.create_share(&bad).await,
            Err(SignalingError::Validation(_))
        ));
        assert!(backend.post(&envelope(SignalKind::Offer, "")).await.is_err());
    }
}
