//! Registry of live sessions, passed around explicitly from `main`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::state::{Direction, FileDescriptor, Transfer};
use super::TransferSession;
use crate::core::config::TransferConfig;
use crate::utils::sos::SignalOfStop;

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, TransferSession>>>,
    stop: SignalOfStop,
    config: TransferConfig,
}

impl SessionManager {
    /// Sessions created here stop when `stop` does.
    pub fn new(stop: SignalOfStop, config: TransferConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stop,
            config,
        }
    }

    /// Create and register a session for transfer `id`.
    pub async fn create(
        &self,
        id: Uuid,
        direction: Direction,
        file: FileDescriptor,
    ) -> TransferSession {
        let session = TransferSession::new(id, direction, file, &self.stop, self.config.clone());
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    pub async fn get(&self, id: &Uuid) -> Option<TransferSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Close and forget one session.
    pub async fn remove(&self, id: &Uuid) -> Option<TransferSession> {
        let session = self.sessions.write().await.remove(id);
        if let Some(s) = &session {
            s.close().await;
        }
        session
    }

    /// Current state of every registered session, oldest first.
    pub async fn snapshot(&self) -> Vec<Transfer> {
        let sessions: Vec<TransferSession> = self.sessions.read().await.values().cloned().collect();
        let mut transfers = Vec::with_capacity(sessions.len());
        for s in sessions {
            transfers.push(s.snapshot().await);
        }
        transfers.sort_by_key(|t| t.started_at);
        transfers
    }

    pub async fn close_all(&self) {
        let sessions: Vec<TransferSession> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!(event = "sessions_closing", count = sessions.len());
        for s in sessions {
            s.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::TransferStatus;
    use crate::core::session::test_support::descriptor;

    #[tokio::test]
    async fn tracks_and_closes_sessions() {
        let root = SignalOfStop::new();
        let manager = SessionManager::new(root.clone(), TransferConfig::default());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        manager.create(a, Direction::Outbound, descriptor("a", 1, 1024)).await;
        manager.create(b, Direction::Inbound, descriptor("b", 1, 1024)).await;

        assert_eq!(manager.snapshot().await.len(), 2);
        assert!(manager.get(&a).await.is_some());

        let removed = manager.remove(&a).await.unwrap();
        assert_eq!(removed.status().await, TransferStatus::Cancelled);
        assert!(manager.get(&a).await.is_none());

        let remaining = manager.get(&b).await.unwrap();
        manager.close_all().await;
        assert!(manager.snapshot().await.is_empty());
        assert_eq!(remaining.status().await, TransferStatus::Cancelled);
        assert!(!root.cancelled());
    }

    #[tokio::test]
    async fn root_stop_reaches_managed_sessions() {
        let root = SignalOfStop::new();
        let manager = SessionManager::new(root.clone(), TransferConfig::default());
        let s = manager
            .create(Uuid::new_v4(), Direction::Outbound, descriptor("a", 1, 1024))
            .await;
        root.cancel();
        assert!(s.stop_signal().cancelled());
    }
}
