//! Centralized configuration constants for peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame type bytes) stay in
//! their respective modules.
//!
//! [`TransferConfig`] carries the subset that may be overridden per run
//! (from `config.toml` or the CLI); its `Default` mirrors the constants.

use serde::Deserialize;
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KB).
///
/// Small enough to stay well below every data channel message ceiling,
/// large enough to keep per-message overhead low. The receiver never
/// relies on this value; only the sender's chunk count travels on the wire.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest file accepted for an outbound transfer (4 GiB).
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Sender-local progress ceiling before the receiver confirms delivery.
pub const SENDER_LOCAL_PROGRESS_CAP: f64 = 95.0;

/// Minimum spacing between two receiver progress reports.
pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_millis(200);

/// Per-chunk budget for a worker round-trip before falling back inline.
pub const WORKER_CHUNK_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a finished session keeps its channel open so the peer can
/// observe the final progress report.
pub const COMPLETION_LINGER: Duration = Duration::from_secs(3);

// ── Backpressure ─────────────────────────────────────────────────────────────

/// High water mark for the data channel send buffer (bytes).
/// When `buffered_amount` exceeds this value, the chunk pump pauses
/// until the buffer drains below [`DC_BUFFERED_AMOUNT_LOW`].
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Low water mark: the pump resumes once the buffer is below this.
pub const DC_BUFFERED_AMOUNT_LOW: usize = DC_BUFFERED_AMOUNT_HIGH / 2;

/// Polling fallback while waiting for a drain notification.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A drain wait that makes no progress for this long is treated as a
/// lost connection.
pub const BACKPRESSURE_STALL_TIMEOUT: Duration = Duration::from_secs(60);

// ── Signaling ────────────────────────────────────────────────────────────────

/// Lifetime of a share record (the offer plus file metadata).
pub const SHARE_RECORD_TTL: Duration = Duration::from_secs(15 * 60);

/// Lifetime of an unread mailbox envelope.
pub const ENVELOPE_TTL: Duration = Duration::from_secs(60 * 60);

/// First mailbox poll interval.
pub const POLL_INTERVAL_MIN: Duration = Duration::from_millis(250);

/// Ceiling for the mailbox poll interval after backing off.
pub const POLL_INTERVAL_MAX: Duration = Duration::from_secs(5);

/// Consecutive empty polls before the interval starts doubling.
pub const POLL_EMPTY_STREAK: u32 = 8;

/// A poll loop stops on its own after this long, resolved or not.
pub const POLL_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Timeout for a single HTTP request to the signaling service.
pub const SIGNALING_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Timeout for ICE candidate gathering in non-trickle mode.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Gathering timeout used once the environment looks restrictive.
pub const ICE_GATHER_TIMEOUT_RESTRICTIVE: Duration = Duration::from_secs(5);

/// Budget from offer/answer exchange to an open data channel.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// ICE agent: no traffic for this long marks the connection disconnected.
pub const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);

/// ICE agent: disconnected for this long marks the connection failed.
pub const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(25);

/// ICE agent keepalive interval.
pub const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Candidate pool size on an unrestricted network.
pub const ICE_CANDIDATE_POOL_SIZE: u8 = 4;

/// Candidate pool size on a restrictive network.
pub const ICE_CANDIDATE_POOL_SIZE_RESTRICTIVE: u8 = 1;

/// Label of the single data channel carried by each transfer.
pub const DATA_CHANNEL_LABEL: &str = "peerdrop";

/// Default STUN server used when the descriptor endpoint returns nothing usable.
pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

// ── Environment probe ────────────────────────────────────────────────────────

/// Timeout for one probe connection attempt.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Median probe latency above which the link counts as slow.
pub const PROBE_LATENCY_CUTOFF: Duration = Duration::from_millis(300);

/// Score at or above which the environment is classified as restrictive.
pub const PROBE_RESTRICTIVE_THRESHOLD: u32 = 4;

/// How long the probe lets a throwaway connection gather candidates.
pub const PROBE_GATHER_TIMEOUT: Duration = Duration::from_secs(3);

// ── Per-run configuration ────────────────────────────────────────────────────

/// Tunable transfer parameters.
///
/// Chunk size and water marks are configuration, not protocol constants:
/// the receiver tolerates whatever chunk size the sender picked.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub buffered_high: usize,
    pub buffered_low: usize,
    #[serde(with = "millis")]
    pub progress_interval: Duration,
    #[serde(with = "millis")]
    pub worker_timeout: Duration,
    #[serde(with = "millis")]
    pub completion_linger: Duration,
    #[serde(with = "millis")]
    pub poll_lifetime: Duration,
    /// Use trickle ICE (publish candidates as they are found).
    pub trickle: bool,
    pub probe_threshold: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            buffered_high: DC_BUFFERED_AMOUNT_HIGH,
            buffered_low: DC_BUFFERED_AMOUNT_LOW,
            progress_interval: PROGRESS_REPORT_INTERVAL,
            worker_timeout: WORKER_CHUNK_TIMEOUT,
            completion_linger: COMPLETION_LINGER,
            poll_lifetime: POLL_LIFETIME,
            trickle: true,
            probe_threshold: PROBE_RESTRICTIVE_THRESHOLD,
        }
    }
}

impl TransferConfig {
    /// Reject combinations the chunk pump cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.buffered_low < self.buffered_high,
            "buffered_low ({}) must be below buffered_high ({})",
            self.buffered_low,
            self.buffered_high
        );
        Ok(())
    }
}

/// Durations are written as integer milliseconds in `config.toml`.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.chunk_size, CHUNK_SIZE);
        assert_eq!(cfg.buffered_low, cfg.buffered_high / 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: TransferConfig =
            toml::from_str("chunk_size = 65536\nprogress_interval = 50\n").unwrap();
        assert_eq!(cfg.chunk_size, 65536);
        assert_eq!(cfg.progress_interval, Duration::from_millis(50));
        assert_eq!(cfg.buffered_high, DC_BUFFERED_AMOUNT_HIGH);
        assert!(cfg.trickle);
    }

    #[test]
    fn inverted_water_marks_are_rejected() {
        let cfg = TransferConfig {
            buffered_low: 10,
            buffered_high: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
