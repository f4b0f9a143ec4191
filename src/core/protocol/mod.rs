//! Data channel protocol: the closed set of control messages and the
//! binary framing that carries them next to raw chunk data.
//!
//! Message flow for one transfer:
//!
//! ```text
//! sender                                   receiver
//!   │ ── Metadata ─────────────────────────────► │
//!   │ ── Chunk 0..n ───────────────────────────► │
//!   │ ◄──────────────────── Pause (approval gate) │
//!   │ ◄──────────────────────────────── Resume    │
//!   │ ◄───────────────────── Progress (throttled) │
//!   │ ── EndOfStream ──────────────────────────► │
//!   │ ◄──────────────── Progress 100 (confirmed) │
//! ```
//!
//! Either side may send `Cancel` at any point.

pub mod frame;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Control Messages ──────────────────────────────────────────────────────────
// JSON-serialized, sent as FRAME_CONTROL on the data channel.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// File description, always the first message from the sender.
    /// `chunk_count` is fixed here; the receiver completes on reaching it.
    #[serde(rename_all = "camelCase")]
    Metadata {
        transfer_id: Uuid,
        name: String,
        byte_size: u64,
        mime_type: String,
        /// Unix milliseconds.
        last_modified: i64,
        chunk_count: u32,
    },
    /// Receiver-side progress report.
    #[serde(rename_all = "camelCase")]
    Progress {
        progress: f64,
        chunks_received: u32,
        chunk_count: u32,
    },
    /// Stop the chunk pump before the next chunk; the channel stays open.
    Pause,
    /// Continue the chunk pump from the current offset.
    Resume,
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Sender finished producing; `chunks_sent` lets the receiver detect loss.
    #[serde(rename_all = "camelCase")]
    EndOfStream { chunks_sent: u32 },
}

impl ControlMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::Progress { .. } => "progress",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel { .. } => "cancel",
            Self::EndOfStream { .. } => "end_of_stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_camel_case() {
        let json = serde_json::to_string(&ControlMessage::Progress {
            progress: 50.0,
            chunks_received: 1,
            chunk_count: 2,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"progress","progress":50.0,"chunksReceived":1,"chunkCount":2}"#
        );

        let cancel: ControlMessage = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert_eq!(cancel, ControlMessage::Cancel { reason: None });

        let eos: ControlMessage =
            serde_json::from_str(r#"{"type":"endOfStream","chunksSent":3}"#).unwrap();
        assert_eq!(eos, ControlMessage::EndOfStream { chunks_sent: 3 });
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
