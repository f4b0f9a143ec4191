//! Out-of-band signaling through a short-lived mailbox service.
//!
//! Two collaborators live behind [`SignalingBackend`]:
//!
//! - the **share record** store: the sender publishes its offer plus file
//!   metadata under a short id that expires after 15 minutes;
//! - the **mailbox**: per-peer queues of [`SignalingEnvelope`]s that are
//!   deleted when read (at most once delivery), discarded after an hour.
//!
//! The same backend also hands out connectivity-server descriptors.
//! [`client::SignalingClient`] adds envelope construction, validation and
//! the backoff poll loop on top.

pub mod client;
pub mod http;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of a generated share id.
pub const SHARE_ID_LEN: usize = 8;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("share not found")]
    NotFound,

    #[error("share expired")]
    Expired,

    #[error("invalid signaling data: {0}")]
    Validation(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signaling service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Mailbox envelopes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    /// Session description from the initiating side.
    Offer,
    /// Session description from the joining side.
    Answer,
    /// One trickled ICE candidate.
    Candidate,
    /// The joining side announcing its peer id.
    PeerInfo,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::PeerInfo => "peerInfo",
        })
    }
}

/// One message in a peer's mailbox. `payload` is opaque JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sender_id: String,
    pub receiver_id: String,
    pub payload: String,
    /// Unix milliseconds at the sender.
    #[serde(default)]
    pub timestamp: i64,
}

impl SignalingEnvelope {
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.sender_id.trim().is_empty() {
            return Err(SignalingError::Validation("envelope without sender id".into()));
        }
        if self.receiver_id.trim().is_empty() {
            return Err(SignalingError::Validation("envelope without receiver id".into()));
        }
        if self.payload.is_empty() {
            return Err(SignalingError::Validation(format!(
                "{} envelope without payload",
                self.kind
            )));
        }
        Ok(())
    }
}

// ── Share records ─────────────────────────────────────────────────────────────

/// Hints the sender attaches to its share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SenderFlags {
    /// The sender's environment probe classified its network as restrictive.
    pub restrictive_network: bool,
    /// The offer only carries relay candidates.
    pub relay_only: bool,
    /// Candidates keep arriving through the mailbox after the offer.
    pub trickle: bool,
}

/// What the sender publishes under a share id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    pub transfer_id: Uuid,
    /// Serialized session description of the offer.
    pub offer: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_hash: Option<String>,
    #[serde(default)]
    pub sender_flags: SenderFlags,
    /// Mailbox id answers and candidates for the sender go to.
    pub sender_id: String,
}

impl ShareRecord {
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.offer.trim().is_empty() {
            return Err(SignalingError::Validation("share record without offer".into()));
        }
        if self.file_name.trim().is_empty() {
            return Err(SignalingError::Validation("share record without file name".into()));
        }
        if self.sender_id.trim().is_empty() {
            return Err(SignalingError::Validation("share record without sender id".into()));
        }
        if let Some(hash) = &self.pin_hash
            && (hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(SignalingError::Validation("malformed pin hash".into()));
        }
        Ok(())
    }

    pub fn requires_pin(&self) -> bool {
        self.pin_hash.is_some()
    }
}

/// Short human-typeable share id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(pub String);

impl ShareId {
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SHARE_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Accept what a user typed: trimmed, alphanumeric only.
    pub fn parse(raw: &str) -> Result<Self, SignalingError> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SignalingError::Validation(format!("invalid share id {raw:?}")));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Connectivity servers ──────────────────────────────────────────────────────

/// One STUN/TURN server as handed out by the descriptor endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerDescriptor {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerDescriptor {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Any of the urls is a TURN relay.
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerList {
    #[serde(default)]
    pub servers: Vec<IceServerDescriptor>,
    /// The service observed this client behind a restrictive network.
    #[serde(default)]
    pub restrictive_network: bool,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

// ── Backend seam ──────────────────────────────────────────────────────────────

/// Transport to the signaling service.
#[async_trait]
pub trait SignalingBackend: Send + Sync {
    async fn create_share(&self, record: &ShareRecord) -> Result<ShareId, SignalingError>;

    /// `NotFound` for unknown ids, `Expired` once the TTL has passed.
    async fn fetch_share(&self, id: &ShareId) -> Result<ShareRecord, SignalingError>;

    async fn update_pin(&self, id: &ShareId, pin_hash: Option<String>) -> Result<(), SignalingError>;

    /// Append to the receiver's queue.
    async fn post(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError>;

    /// Return and delete everything queued for `receiver_id`.
    async fn drain(&self, receiver_id: &str) -> Result<Vec<SignalingEnvelope>, SignalingError>;

    async fn ice_servers(&self) -> Result<IceServerList, SignalingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ShareRecord {
        ShareRecord {
            transfer_id: Uuid::new_v4(),
            offer: r#"{"type":"offer","sdp":"v=0"}"#.into(),
            file_name: "a.txt".into(),
            file_size: 3,
            pin_hash: None,
            sender_flags: SenderFlags::default(),
            sender_id: "sender-1".into(),
        }
    }

    #[test]
    fn envelope_wire_format() {
        let env = SignalingEnvelope {
            kind: SignalKind::PeerInfo,
            sender_id: "a".into(),
            receiver_id: "b".into(),
            payload: "{}".into(),
            timestamp: 1,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "peerInfo");
        assert_eq!(json["senderId"], "a");
        assert_eq!(json["receiverId"], "b");
    }

    #[test]
    fn envelope_validation() {
        let mut env = SignalingEnvelope {
            kind: SignalKind::Candidate,
            sender_id: "a".into(),
            receiver_id: "b".into(),
            payload: "{}".into(),
            timestamp: 0,
        };
        assert!(env.validate().is_ok());
        env.payload.clear();
        assert!(env.validate().is_err());
        env.payload = "{}".into();
        env.receiver_id = " ".into();
        assert!(env.validate().is_err());
    }

    #[test]
    fn share_record_validation() {
        assert!(record().validate().is_ok());

        let mut r = record();
        r.offer = String::new();
        assert!(matches!(r.validate(), Err(SignalingError::Validation(_))));

        let mut r = record();
        r.pin_hash = Some("abc".into());
        assert!(r.validate().is_err());

        let mut r = record();
        r.pin_hash = Some("a".repeat(64));
        assert!(r.validate().is_ok());
        assert!(r.requires_pin());
    }

    #[test]
    fn share_record_missing_fields_fail_to_parse() {
        let err = serde_json::from_str::<ShareRecord>(r#"{"offer":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn ice_urls_accept_string_or_list() {
        let list: IceServerList = serde_json::from_str(
            r#"{"servers":[{"urls":"stun:a:3478"},{"urls":["turn:b:3478","turns:b:5349"],"username":"1700000000:u","credential":"c"}],"restrictiveNetwork":true}"#,
        )
        .unwrap();
        assert_eq!(list.servers[0].urls, vec!["stun:a:3478".to_string()]);
        assert!(!list.servers[0].is_relay());
        assert!(list.servers[1].is_relay());
        assert!(list.restrictive_network);
    }

    #[test]
    fn share_ids() {
        let id = ShareId::generate();
        assert_eq!(id.as_str().len(), SHARE_ID_LEN);
        assert!(ShareId::parse(id.as_str()).is_ok());
        assert_eq!(ShareId::parse("  Ab12 ").unwrap().as_str(), "Ab12");
        assert!(ShareId::parse("../x").is_err());
        assert!(ShareId::parse("").is_err());
    }
}
