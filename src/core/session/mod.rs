//! Per-transfer session: one [`Transfer`] record, one transport channel and
//! the tasks moving bytes over it.
//!
//! The sending half lives in [`sender`], the receiving half in [`receiver`].
//! Both publish every state or progress change on a broadcast channel;
//! subscribing is just taking a new receiver.

pub mod manager;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod state;

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::TransferConfig;
use crate::core::connection::TransportChannel;
use crate::core::error::TransferError;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::frame::encode_control_frame;
use crate::utils::sos::SignalOfStop;

pub use manager::SessionManager;
pub use receiver::{ApprovalGate, ReceiveOutcome};
pub use sink::{DirectorySink, FileSink, SavedFile};
pub use state::{Direction, FileDescriptor, Transfer, TransferStatus};

const UPDATE_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct TransferSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    state: RwLock<Transfer>,
    updates: broadcast::Sender<Transfer>,
    channel: Mutex<ChannelSlot>,
    stop: SignalOfStop,
    config: TransferConfig,
}

/// Lifecycle of the one channel a transfer may use.
enum ChannelSlot {
    Unbound,
    Bound(Arc<dyn TransportChannel>),
    Released,
}

impl TransferSession {
    /// Create a session in `Connecting`. Its stop signal is a child of
    /// `parent`.
    pub fn new(
        id: Uuid,
        direction: Direction,
        file: FileDescriptor,
        parent: &SignalOfStop,
        config: TransferConfig,
    ) -> Self {
        let mut transfer = Transfer::new(id, direction, file);
        transfer.transition(TransferStatus::Connecting);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        info!(event = "session_created", transfer_id = %id, ?direction);
        Self {
            inner: Arc::new(SessionInner {
                id,
                state: RwLock::new(transfer),
                updates,
                channel: Mutex::new(ChannelSlot::Unbound),
                stop: parent.child(),
                config,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub fn stop_signal(&self) -> &SignalOfStop {
        &self.inner.stop
    }

    pub async fn snapshot(&self) -> Transfer {
        self.inner.state.read().await.clone()
    }

    pub async fn status(&self) -> TransferStatus {
        self.inner.state.read().await.status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transfer> {
        self.inner.updates.subscribe()
    }

    /// Bind the transport channel. A transfer has exactly one; once it
    /// was released (or the session closed first) nothing can be bound.
    pub(crate) async fn bind_channel(
        &self,
        channel: Arc<dyn TransportChannel>,
    ) -> Result<(), TransferError> {
        let mut slot = self.inner.channel.lock().await;
        match *slot {
            ChannelSlot::Unbound => {
                *slot = ChannelSlot::Bound(channel);
                Ok(())
            }
            ChannelSlot::Bound(_) => Err(TransferError::Validation(
                "transfer already has a channel".into(),
            )),
            ChannelSlot::Released => Err(TransferError::cancelled("session already closed")),
        }
    }

    // ── State updates ────────────────────────────────────────────────────

    pub(crate) async fn transition(&self, next: TransferStatus) -> bool {
        self.update(|t| t.transition(next)).await
    }

    /// Record a terminal failure or cancellation. No-op once terminal.
    pub(crate) async fn finish_with(&self, error: TransferError) -> bool {
        self.update(|t| t.finish_with(error)).await
    }

    /// Replace the file description (the receiver learns the chunk count
    /// from the sender's metadata).
    pub(crate) async fn set_file(&self, file: FileDescriptor) {
        self.update(|t| {
            t.file = file;
            true
        })
        .await;
    }

    pub(crate) async fn record_progress(&self, percent: f64) -> bool {
        self.update(|t| t.record_progress(percent)).await
    }

    pub(crate) async fn record_local_progress(&self, percent: f64) -> bool {
        self.update(|t| t.record_local_progress(percent)).await
    }

    async fn update(&self, f: impl FnOnce(&mut Transfer) -> bool) -> bool {
        let mut state = self.inner.state.write().await;
        if !f(&mut state) {
            return false;
        }
        // No subscribers is fine.
        let _ = self.inner.updates.send(state.clone());
        true
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Stop the session: cancel its tasks, close the channel, and mark it
    /// `Cancelled` unless it already ended. A completed session stays
    /// completed.
    pub async fn close(&self) {
        self.inner.stop.cancel();
        self.finish_with(TransferError::cancelled("closed locally"))
            .await;
        self.release_channel().await;
    }

    /// Close the bound channel, if any. Later binds are refused.
    pub(crate) async fn release_channel(&self) {
        let slot = std::mem::replace(&mut *self.inner.channel.lock().await, ChannelSlot::Released);
        if let ChannelSlot::Bound(channel) = slot {
            channel.close().await;
            info!(event = "session_channel_closed", transfer_id = %self.inner.id);
        }
    }
}

/// Encode and send one control message. Any send failure means the
/// channel is gone.
pub(crate) async fn send_control(
    channel: &dyn TransportChannel,
    msg: &ControlMessage,
) -> Result<(), TransferError> {
    let frame = encode_control_frame(msg).map_err(|e| TransferError::Validation(e.to_string()))?;
    channel.send(frame).await.map_err(|e| {
        debug!(event = "control_send_failed", kind = msg.kind(), error = %e);
        TransferError::ConnectionLost
    })
}
