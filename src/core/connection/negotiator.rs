//! Offer/answer/candidate negotiation for one transfer's peer connection.
//!
//! The negotiator owns the `RTCPeerConnection` and never touches signaling
//! itself: local candidates, state changes and the opened channel are
//! reported through [`NegotiatorEvent`]s and the caller moves them over the
//! mailbox.
//!
//! Remote candidates may arrive in any order. Anything received before the
//! remote description is queued and applied once it is set; repeats are
//! dropped. When the connection fails before it ever connected, exactly one
//! retry is made with a fresh peer connection restricted to relay
//! candidates. Callbacks from the abandoned connection are ignored through
//! a generation counter.

use anyhow::{Context, Result, anyhow, bail, ensure};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::candidate::{CandidateKind, CandidateSet, is_end_of_candidates, sdp_candidate_kinds};
use super::channel::{ChannelEvent, RtcChannel};
use super::ice;
use super::probe::{self, EnvironmentSignals, NegotiationParams, ProbeResult};
use crate::core::config::{
    DATA_CHANNEL_LABEL, ICE_DISCONNECTED_TIMEOUT, ICE_FAILED_TIMEOUT, ICE_KEEPALIVE_INTERVAL,
};
use crate::core::signaling::IceServerDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer and the data channel (sender).
    Offerer,
    /// Answers a published offer (receiver).
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offerer => "offerer",
            Self::Answerer => "answerer",
        })
    }
}

/// Connection lifecycle as seen by the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Gathering,
    Checking,
    Connected,
    /// Transient; ICE may recover to `Connected`.
    Disconnected,
    /// Terminal.
    Failed,
    /// Closed locally. Terminal.
    Closed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Failed | Closed, _) => false,
            (_, Closed) => true,
            (New, Gathering | Checking | Failed) => true,
            (Gathering, Checking | Connected | Failed) => true,
            (Checking, Connected | Disconnected | Failed) => true,
            (Connected, Disconnected | Failed) => true,
            (Disconnected, Connected | Failed) => true,
            _ => false,
        }
    }

    fn from_rtc(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(Self::New),
            RTCPeerConnectionState::Connecting => Some(Self::Checking),
            RTCPeerConnectionState::Connected => Some(Self::Connected),
            RTCPeerConnectionState::Disconnected => Some(Self::Disconnected),
            RTCPeerConnectionState::Failed => Some(Self::Failed),
            RTCPeerConnectionState::Closed => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Reported to the owner of the negotiator.
pub enum NegotiatorEvent {
    /// A local candidate to forward to the peer.
    LocalCandidate(RTCIceCandidateInit),
    GatheringComplete,
    StateChanged(ChannelState),
    /// The data channel is open; the receiver carries its inbound events.
    ChannelOpen {
        channel: Arc<RtcChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    },
}

/// State touched from webrtc callbacks.
struct Shared {
    generation: AtomicU64,
    state: StdMutex<ChannelState>,
    connected_once: AtomicBool,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Apply `next` if the state machine allows it.
    fn transition(&self, next: ChannelState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state == next {
            return false;
        }
        if !state.can_transition_to(next) {
            debug!(event = "channel_state_ignored", from = ?*state, to = ?next);
            return false;
        }
        *state = next;
        if next == ChannelState::Connected {
            self.connected_once.store(true, Ordering::Release);
        }
        true
    }

    fn reset(&self) -> u64 {
        if let Ok(mut state) = self.state.lock() {
            *state = ChannelState::New;
        }
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Default)]
struct Inner {
    pc: Option<Arc<RTCPeerConnection>>,
    relay_only: bool,
    relay_retried: bool,
    remote_sdp: Option<String>,
    local_sdp: Option<String>,
    pending: Vec<RTCIceCandidateInit>,
    applied: CandidateSet,
}

pub struct ConnectionNegotiator {
    role: Role,
    params: NegotiationParams,
    descriptors: Vec<IceServerDescriptor>,
    low_threshold: usize,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
}

impl ConnectionNegotiator {
    pub fn new(
        role: Role,
        params: NegotiationParams,
        descriptors: Vec<IceServerDescriptor>,
        low_threshold: usize,
    ) -> (Self, mpsc::UnboundedReceiver<NegotiatorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let negotiator = Self {
            role,
            params,
            descriptors,
            low_threshold,
            events,
            shared: Arc::new(Shared {
                generation: AtomicU64::new(0),
                state: StdMutex::new(ChannelState::New),
                connected_once: AtomicBool::new(false),
            }),
            inner: Mutex::new(Inner {
                relay_only: params.relay_only,
                ..Default::default()
            }),
        };
        (negotiator, rx)
    }

    /// Score the environment and derive negotiation parameters from it.
    pub async fn environment_probe(
        signals: EnvironmentSignals,
        probe_target: Option<&str>,
        threshold: u32,
    ) -> ProbeResult {
        probe::environment_probe(signals, probe_target, threshold).await
    }

    /// Gather local candidates on a throwaway connection and report their
    /// kinds. Stops when gathering completes or `wait` runs out, whichever
    /// comes first.
    pub async fn sample_candidate_kinds(
        descriptors: &[IceServerDescriptor],
        wait: Duration,
    ) -> Result<Vec<CandidateKind>> {
        let api = create_webrtc_api()?;
        let config = RTCConfiguration {
            ice_servers: ice::usable_servers(descriptors, chrono::Utc::now().timestamp(), false),
            ..Default::default()
        };
        let pc = api.new_peer_connection(config).await?;

        let sampled: Result<Vec<CandidateKind>> = async {
            pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            let offer = pc.create_offer(None).await?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(offer).await?;
            if timeout(wait, gathered.recv()).await.is_err() {
                debug!(event = "candidate_sample_timeout", timeout_secs = wait.as_secs());
            }
            let local = pc
                .local_description()
                .await
                .ok_or_else(|| anyhow!("no local description after set_local_description"))?;
            Ok(sdp_candidate_kinds(&local.sdp))
        }
        .await;

        if let Err(e) = pc.close().await {
            debug!(event = "pc_close_error", error = %e);
        }
        if let Ok(kinds) = &sampled {
            debug!(event = "candidate_sample", kinds = ?kinds);
        }
        sampled
    }

    pub fn state(&self) -> ChannelState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ChannelState::Failed)
    }

    pub async fn relay_only(&self) -> bool {
        self.inner.lock().await.relay_only
    }

    /// A relay-only retry is still available.
    pub async fn can_retry(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.relay_retried && !self.shared.connected_once.load(Ordering::Acquire)
    }

    // ── Offer / Answer ───────────────────────────────────────────────────

    /// Create the local offer (offerer side).
    ///
    /// In trickle mode this returns as soon as the description is set and
    /// candidates follow as events; otherwise it waits for gathering to
    /// finish (bounded by the gather timeout). Calling it again returns the
    /// same offer.
    pub async fn create_offer(&self) -> Result<String> {
        ensure!(self.role == Role::Offerer, "only the offerer creates offers");
        let mut inner = self.inner.lock().await;
        if let Some(sdp) = &inner.local_sdp {
            return Ok(sdp.clone());
        }
        self.start_offer(&mut inner).await
    }

    /// Apply the remote offer and return the local answer (answerer side).
    ///
    /// A repeated offer returns the existing answer. A different offer after
    /// one was already answered means the sender restarted on relay; the
    /// local side then restarts as well (at most once).
    pub async fn accept_offer(&self, remote: &str) -> Result<String> {
        ensure!(self.role == Role::Answerer, "only the answerer accepts offers");
        let mut inner = self.inner.lock().await;

        if let Some(current) = &inner.remote_sdp {
            if current == remote
                && let Some(local) = &inner.local_sdp
            {
                debug!(event = "offer_duplicate", "Ignoring repeated offer");
                return Ok(local.clone());
            }
            if inner.relay_retried {
                bail!("peer renegotiated more than once");
            }
            info!(event = "relay_retry_remote", "Peer restarted negotiation, following on relay");
            self.reset(&mut inner).await;
        }

        let desc: RTCSessionDescription =
            serde_json::from_str(remote).context("malformed offer description")?;

        let pc = match &inner.pc {
            Some(pc) => pc.clone(),
            None => {
                let pc = self.build_peer_connection(inner.relay_only).await?;
                inner.pc = Some(pc.clone());
                pc
            }
        };

        pc.set_remote_description(desc)
            .await
            .context("applying remote offer")?;
        inner.remote_sdp = Some(remote.to_string());
        self.flush_pending(&mut inner, &pc).await;

        let local = self.describe_local(&pc, false).await?;
        inner.local_sdp = Some(local.clone());
        Ok(local)
    }

    /// Apply the remote answer (offerer side). Repeats are no-ops.
    pub async fn apply_remote_answer(&self, remote: &str) -> Result<()> {
        ensure!(self.role == Role::Offerer, "only the offerer applies answers");
        let mut inner = self.inner.lock().await;
        let pc = inner
            .pc
            .clone()
            .ok_or_else(|| anyhow!("answer received before an offer was created"))?;

        match inner.remote_sdp.as_deref() {
            Some(current) if current == remote => {
                debug!(event = "answer_duplicate", "Ignoring repeated answer");
                return Ok(());
            }
            Some(_) => {
                warn!(event = "answer_conflict", "Ignoring second, different answer");
                return Ok(());
            }
            None => {}
        }

        let desc: RTCSessionDescription =
            serde_json::from_str(remote).context("malformed answer description")?;
        pc.set_remote_description(desc)
            .await
            .context("applying remote answer")?;
        inner.remote_sdp = Some(remote.to_string());
        self.flush_pending(&mut inner, &pc).await;
        Ok(())
    }

    /// Apply one remote candidate, queueing it until the remote
    /// description is known. Applying the same candidate twice is the same
    /// as applying it once.
    pub async fn apply_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if is_end_of_candidates(&candidate) {
            debug!(event = "remote_candidates_done");
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if !inner.applied.insert(&candidate) {
            debug!(event = "candidate_duplicate", candidate = %candidate.candidate);
            return Ok(());
        }

        let pc = match (&inner.pc, &inner.remote_sdp) {
            (Some(pc), Some(_)) => pc.clone(),
            _ => {
                debug!(event = "candidate_queued", pending = inner.pending.len() + 1);
                inner.pending.push(candidate);
                return Ok(());
            }
        };

        let kind = CandidateKind::parse(&candidate.candidate);
        pc.add_ice_candidate(candidate)
            .await
            .context("adding remote candidate")?;
        debug!(event = "candidate_applied", kind = ?kind);
        Ok(())
    }

    /// Restart once with a relay-only peer connection.
    ///
    /// The offerer gets a new offer to publish; the answerer gets `None` and
    /// waits for that offer. Fails if the retry was already used or the
    /// connection had connected at some point.
    pub async fn retry_relay_only(&self) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        if inner.relay_retried {
            bail!("relay-only retry already used");
        }
        if self.shared.connected_once.load(Ordering::Acquire) {
            bail!("connection was established before; not a negotiation failure");
        }
        self.reset(&mut inner).await;
        match self.role {
            Role::Offerer => Ok(Some(self.start_offer(&mut inner).await?)),
            Role::Answerer => Ok(None),
        }
    }

    /// Tear down the peer connection. Later callbacks are ignored.
    pub async fn close(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut state) = self.shared.state.lock() {
            *state = ChannelState::Closed;
        }
        let pc = self.inner.lock().await.pc.take();
        if let Some(pc) = pc
            && let Err(e) = pc.close().await
        {
            debug!(event = "pc_close_error", error = %e);
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn start_offer(&self, inner: &mut Inner) -> Result<String> {
        let pc = self.build_peer_connection(inner.relay_only).await?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .context("creating data channel")?;
        wire_channel(
            dc,
            self.events.clone(),
            self.shared.clone(),
            self.shared.generation.load(Ordering::Acquire),
            self.low_threshold,
        )
        .await;

        inner.pc = Some(pc.clone());
        let local = self.describe_local(&pc, true).await?;
        inner.local_sdp = Some(local.clone());
        Ok(local)
    }

    async fn reset(&self, inner: &mut Inner) {
        self.shared.reset();
        if let Some(pc) = inner.pc.take()
            && let Err(e) = pc.close().await
        {
            debug!(event = "pc_close_error", error = %e);
        }
        inner.relay_only = true;
        inner.relay_retried = true;
        inner.remote_sdp = None;
        inner.local_sdp = None;
        inner.pending.clear();
        inner.applied.clear();
        info!(event = "relay_retry", role = %self.role, "Retrying negotiation with relay-only transport");
    }

    async fn flush_pending(&self, inner: &mut Inner, pc: &Arc<RTCPeerConnection>) {
        let pending = std::mem::take(&mut inner.pending);
        if pending.is_empty() {
            return;
        }
        debug!(event = "candidates_flushed", count = pending.len());
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!(event = "candidate_rejected", error = %e, "Queued candidate rejected");
            }
        }
    }

    /// Set the local description and serialize it.
    async fn describe_local(&self, pc: &Arc<RTCPeerConnection>, offer: bool) -> Result<String> {
        let desc = if offer {
            pc.create_offer(None).await?
        } else {
            pc.create_answer(None).await?
        };
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(desc).await?;

        if self.shared.transition(ChannelState::Gathering) {
            let _ = self
                .events
                .send(NegotiatorEvent::StateChanged(ChannelState::Gathering));
        }

        if !self.params.trickle
            && timeout(self.params.gather_timeout, gathered.recv())
                .await
                .is_err()
        {
            warn!(
                event = "ice_gather_timeout",
                timeout_secs = self.params.gather_timeout.as_secs(),
                "Sending description with the candidates gathered so far"
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description after set_local_description"))?;
        Ok(serde_json::to_string(&local)?)
    }

    async fn build_peer_connection(&self, relay_only: bool) -> Result<Arc<RTCPeerConnection>> {
        let generation = self.shared.generation.load(Ordering::Acquire);
        let api = create_webrtc_api()?;

        let now = chrono::Utc::now().timestamp();
        let config = RTCConfiguration {
            ice_servers: ice::usable_servers(&self.descriptors, now, relay_only),
            ice_transport_policy: if relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ice_candidate_pool_size: self.params.candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        info!(
            event = "pc_created",
            role = %self.role,
            relay_only,
            generation,
            pool = self.params.candidate_pool_size,
        );

        let events = self.events.clone();
        let shared = self.shared.clone();
        let trickle = self.params.trickle;
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let shared = shared.clone();
            Box::pin(async move {
                if !shared.is_current(generation) {
                    return;
                }
                let Some(candidate) = candidate else {
                    let _ = events.send(NegotiatorEvent::GatheringComplete);
                    return;
                };
                if !trickle {
                    return;
                }
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(event = "candidate_serialize_failed", error = %e);
                        return;
                    }
                };
                let kind = CandidateKind::parse(&init.candidate);
                if relay_only && kind != Some(CandidateKind::Relay) {
                    debug!(event = "candidate_filtered", kind = ?kind, "Dropping non-relay candidate");
                    return;
                }
                let _ = events.send(NegotiatorEvent::LocalCandidate(init));
            })
        }));

        let events = self.events.clone();
        let shared = self.shared.clone();
        let role = self.role;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = events.clone();
            let shared = shared.clone();
            Box::pin(async move {
                if !shared.is_current(generation) {
                    return;
                }
                let Some(next) = ChannelState::from_rtc(s) else {
                    return;
                };
                if !shared.transition(next) {
                    return;
                }
                match next {
                    ChannelState::Connected => {
                        info!(event = "webrtc_connected", %role, "WebRTC connection established");
                    }
                    ChannelState::Failed => {
                        error!(event = "webrtc_failed", %role, "WebRTC connection failed");
                    }
                    ChannelState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            %role,
                            "WebRTC transient disconnect (ICE may recover)"
                        );
                    }
                    _ => debug!(event = "webrtc_state", %role, state = ?next),
                }
                let _ = events.send(NegotiatorEvent::StateChanged(next));
            })
        }));

        if self.role == Role::Answerer {
            let events = self.events.clone();
            let shared = self.shared.clone();
            let low_threshold = self.low_threshold;
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let shared = shared.clone();
                Box::pin(async move {
                    if !shared.is_current(generation) {
                        return;
                    }
                    wire_channel(dc, events, shared, generation, low_threshold).await;
                })
            }));
        }

        Ok(pc)
    }

    #[cfg(test)]
    async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

fn create_webrtc_api() -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_ice_timeouts(
        Some(ICE_DISCONNECTED_TIMEOUT),
        Some(ICE_FAILED_TIMEOUT),
        Some(ICE_KEEPALIVE_INTERVAL),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// Attach channel handlers now and announce the channel once it opens.
async fn wire_channel(
    dc: Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    shared: Arc<Shared>,
    generation: u64,
    low_threshold: usize,
) {
    let (channel, channel_events) = RtcChannel::attach(dc.clone(), low_threshold).await;
    let slot = Arc::new(StdMutex::new(Some((channel, channel_events))));

    let announce = Arc::new(move || {
        if !shared.is_current(generation) {
            return;
        }
        let taken = slot.lock().ok().and_then(|mut s| s.take());
        if let Some((channel, events_rx)) = taken {
            info!(event = "dc_open", channel = %channel.label(), "DataChannel open");
            let _ = events.send(NegotiatorEvent::ChannelOpen {
                channel,
                events: events_rx,
            });
        }
    });

    let on_open = announce.clone();
    dc.on_open(Box::new(move || {
        let on_open = on_open.clone();
        Box::pin(async move { on_open() })
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        announce();
    }
}
