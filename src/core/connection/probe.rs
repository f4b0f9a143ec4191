//! Environment probe: guess whether direct connectivity is likely to fail.
//!
//! Independent signals each add a weight to a score; at or above the
//! threshold the environment counts as restrictive. The outcome only tunes
//! negotiation parameters (relay-only policy, candidate pool size, gather
//! timeout). It never blocks a connection attempt.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::candidate::CandidateKind;
use crate::core::config::{
    ICE_CANDIDATE_POOL_SIZE, ICE_CANDIDATE_POOL_SIZE_RESTRICTIVE, ICE_GATHER_TIMEOUT,
    ICE_GATHER_TIMEOUT_RESTRICTIVE, PROBE_CONNECT_TIMEOUT, PROBE_LATENCY_CUTOFF,
};

// ── Signal weights ───────────────────────────────────────────────────────────

const WEIGHT_SERVICE_FLAGGED: u32 = 3;
const WEIGHT_PEER_FLAGGED: u32 = 1;
const WEIGHT_NO_STUN: u32 = 2;
const WEIGHT_SLOW_LINK: u32 = 1;
const WEIGHT_UNREACHABLE: u32 = 2;
const WEIGHT_HOST_ONLY: u32 = 2;

/// Observations feeding the probe score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentSignals {
    /// The descriptor endpoint reported this client as restricted.
    pub service_flagged: bool,
    /// The remote peer's share record says it is restricted.
    pub peer_flagged: bool,
    /// No STUN server is left after credential filtering.
    pub no_stun: bool,
    /// The signaling host answered slower than the latency cutoff.
    pub slow_link: bool,
    /// The signaling host could not be reached over TCP at all.
    pub unreachable: bool,
    /// Local gathering produced no server-reflexive or relay candidate.
    pub host_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub restrictive: bool,
    pub score: u32,
}

impl EnvironmentSignals {
    pub fn score(&self) -> u32 {
        [
            (self.service_flagged, WEIGHT_SERVICE_FLAGGED),
            (self.peer_flagged, WEIGHT_PEER_FLAGGED),
            (self.no_stun, WEIGHT_NO_STUN),
            (self.slow_link, WEIGHT_SLOW_LINK),
            (self.unreachable, WEIGHT_UNREACHABLE),
            (self.host_only, WEIGHT_HOST_ONLY),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, w)| w)
        .sum()
    }

    pub fn classify(&self, threshold: u32) -> ProbeResult {
        let score = self.score();
        ProbeResult {
            restrictive: score >= threshold,
            score,
        }
    }
}

/// `true` when every gathered local candidate is a host candidate (or
/// nothing was gathered at all): no STUN or TURN server answered.
pub fn host_only(kinds: &[CandidateKind]) -> bool {
    kinds.iter().all(|k| *k == CandidateKind::Host)
}

/// Knobs handed to the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationParams {
    pub relay_only: bool,
    pub candidate_pool_size: u8,
    pub gather_timeout: Duration,
    /// Publish candidates as found instead of waiting for gathering.
    pub trickle: bool,
}

impl Default for NegotiationParams {
    fn default() -> Self {
        Self {
            relay_only: false,
            candidate_pool_size: ICE_CANDIDATE_POOL_SIZE,
            gather_timeout: ICE_GATHER_TIMEOUT,
            trickle: true,
        }
    }
}

impl NegotiationParams {
    /// Parameters for a probe outcome. Relay-only is only forced when a
    /// relay is actually available.
    pub fn from_probe(probe: ProbeResult, relay_available: bool, trickle: bool) -> Self {
        if probe.restrictive {
            Self {
                relay_only: relay_available,
                candidate_pool_size: ICE_CANDIDATE_POOL_SIZE_RESTRICTIVE,
                gather_timeout: ICE_GATHER_TIMEOUT_RESTRICTIVE,
                trickle,
            }
        } else {
            Self {
                trickle,
                ..Self::default()
            }
        }
    }
}

/// Time one TCP connect to `target` (`host:port`).
///
/// `None` when the connect fails or times out.
pub async fn measure_latency(target: &str) -> Option<Duration> {
    let start = Instant::now();
    match tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Some(start.elapsed()),
        Ok(Err(e)) => {
            debug!(event = "probe_connect_failed", target, error = %e);
            None
        }
        Err(_) => {
            debug!(event = "probe_connect_timeout", target);
            None
        }
    }
}

/// `host:port` of a signaling base URL, for latency probing.
pub fn probe_target(base_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Fill in the network-measured signals and classify.
pub async fn environment_probe(
    mut signals: EnvironmentSignals,
    target: Option<&str>,
    threshold: u32,
) -> ProbeResult {
    if let Some(target) = target {
        match measure_latency(target).await {
            Some(rtt) => signals.slow_link = rtt > PROBE_LATENCY_CUTOFF,
            None => signals.unreachable = true,
        }
    }
    let result = signals.classify(threshold);
    info!(
        event = "environment_probe",
        restrictive = result.restrictive,
        score = result.score,
        threshold,
        ?signals,
    );
    result
}
