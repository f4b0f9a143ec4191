//! Transfer record and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::config::SENDER_LOCAL_PROGRESS_CAP;
use crate::core::error::TransferError;

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    /// Created, nothing attempted yet.
    Pending,
    /// Negotiating the transport channel.
    Connecting,
    Transferring,
    /// The receiver is waiting for a user decision; chunks are held back.
    PendingApproval,
    /// Transferring again after an approval.
    TransferringResumed,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn is_transferring(self) -> bool {
        matches!(self, Self::Transferring | Self::TransferringResumed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Completed | Cancelled | Failed, _) => false,
            (Pending, Connecting | Cancelled | Failed) => true,
            (Connecting, Transferring | Cancelled | Failed) => true,
            (Transferring | TransferringResumed, PendingApproval | Completed) => true,
            (PendingApproval, TransferringResumed) => true,
            (Transferring | TransferringResumed | PendingApproval, Cancelled | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Transferring => "transferring",
            Self::PendingApproval => "awaiting approval",
            Self::TransferringResumed => "transferring",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// What the receiver learns about the file before any chunk arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub name: String,
    pub byte_size: u64,
    pub mime_type: String,
    /// Unix milliseconds.
    pub last_modified: i64,
    pub chunk_count: u32,
}

// ── Transfer ─────────────────────────────────────────────────────────────────

/// One file movement attempt. Owned by exactly one session.
#[derive(Debug, Clone, Serialize)]
pub struct Transfer {
    pub id: Uuid,
    pub direction: Direction,
    pub file: FileDescriptor,
    pub status: TransferStatus,
    pub progress_percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub error: Option<TransferError>,
}

impl Transfer {
    pub fn new(id: Uuid, direction: Direction, file: FileDescriptor) -> Self {
        Self {
            id,
            direction,
            file,
            status: TransferStatus::Pending,
            progress_percent: 0.0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `next` if allowed. Terminal states never change.
    pub fn transition(&mut self, next: TransferStatus) -> bool {
        if self.status == next {
            return false;
        }
        if !self.status.can_transition_to(next) {
            debug!(
                event = "transfer_transition_ignored",
                transfer_id = %self.id,
                from = ?self.status,
                to = ?next,
            );
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next.is_transferring() && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next == TransferStatus::Completed {
            self.progress_percent = 100.0;
        }
        true
    }

    /// End the transfer with `error`, as `Cancelled` for cancellations and
    /// `Failed` otherwise.
    pub fn finish_with(&mut self, error: TransferError) -> bool {
        let next = if error.is_cancellation() {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Failed
        };
        if !self.transition(next) {
            return false;
        }
        warn!(event = "transfer_ended", transfer_id = %self.id, status = %next, reason = %error);
        self.error = Some(error);
        true
    }

    /// Adopt `percent` if it moves progress forward.
    pub fn record_progress(&mut self, percent: f64) -> bool {
        if self.status.is_terminal() || !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent <= self.progress_percent {
            return false;
        }
        self.progress_percent = percent;
        true
    }

    /// Sender-side estimate; never exceeds the local cap on its own.
    pub fn record_local_progress(&mut self, percent: f64) -> bool {
        self.record_progress(percent.min(SENDER_LOCAL_PROGRESS_CAP))
    }

    /// The only way progress may go backwards.
    #[cfg(test)]
    pub fn reset_progress(&mut self) {
        if !self.status.is_terminal() {
            self.progress_percent = 0.0;
        }
    }
}
