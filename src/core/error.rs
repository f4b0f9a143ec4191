//! Typed failure taxonomy for a single transfer.
//!
//! Orchestration code (CLI flows, negotiator plumbing) uses `anyhow`; the
//! session records one of these as the reason a transfer ended badly so
//! observers can show a stable message.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The peer connection never reached `Connected`, relay retry included.
    #[error("connection could not be established, peer may be offline")]
    Negotiation,

    /// The channel failed or closed before the transfer completed.
    #[error("connection lost")]
    ConnectionLost,

    #[error("transfer cancelled{}", reason_suffix(.reason))]
    Cancelled { reason: Option<String> },

    /// End of stream reached with fewer (or more) chunks than announced.
    #[error("received {received} of {expected} chunks")]
    CountMismatch { expected: u32, received: u32 },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("file is {size} bytes, limit is {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("i/o error: {0}")]
    Io(String),
}

impl TransferError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: Some(reason.into()),
        }
    }

    /// Whether the failure came from the user rather than the network or disk.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_user_facing() {
        assert_eq!(
            TransferError::Negotiation.to_string(),
            "connection could not be established, peer may be offline"
        );
        assert_eq!(TransferError::ConnectionLost.to_string(), "connection lost");
        assert_eq!(
            TransferError::Cancelled { reason: None }.to_string(),
            "transfer cancelled"
        );
        assert_eq!(
            TransferError::cancelled("rejected by receiver").to_string(),
            "transfer cancelled: rejected by receiver"
        );
        assert_eq!(
            TransferError::CountMismatch {
                expected: 611,
                received: 610
            }
            .to_string(),
            "received 610 of 611 chunks"
        );
    }
}
