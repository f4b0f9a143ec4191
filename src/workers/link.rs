//! Moves negotiation traffic between a [`ConnectionNegotiator`] and the
//! mailbox until the data channel opens.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::core::config::{CONNECT_TIMEOUT, PROBE_GATHER_TIMEOUT, TransferConfig};
use crate::core::connection::candidate::CandidateKind;
use crate::core::connection::ice;
use crate::core::connection::probe::{
    self, EnvironmentSignals, NegotiationParams, ProbeResult, probe_target,
};
use crate::core::connection::{
    ChannelEvent, ChannelState, ConnectionNegotiator, NegotiatorEvent, RtcChannel,
};
use crate::core::error::TransferError;
use crate::core::signaling::client::SignalingClient;
use crate::core::signaling::http::HttpBackend;
use crate::core::signaling::{IceServerList, SignalKind, SignalingEnvelope};
use crate::utils::sos::SignalOfStop;

pub type OpenChannel = (Arc<RtcChannel>, mpsc::UnboundedReceiver<ChannelEvent>);

/// Negotiation plumbing for one transfer.
pub struct Link<'a> {
    pub negotiator: &'a ConnectionNegotiator,
    pub events: &'a mut mpsc::UnboundedReceiver<NegotiatorEvent>,
    pub client: &'a SignalingClient,
    pub inbox: &'a mut mpsc::UnboundedReceiver<SignalingEnvelope>,
    /// Mailbox id of the other side, once known.
    pub peer: Option<String>,
    /// A TURN server is configured, so a relay-only retry can succeed.
    pub relay_available: bool,
}

impl Link<'_> {
    /// Exchange answers and candidates until the channel opens.
    ///
    /// The connect deadline starts once the peer is known; before that the
    /// wait is bounded by the mailbox poller's lifetime. A connection that
    /// fails (or times out) before ever connecting gets one relay-only
    /// retry, provided a relay is configured.
    pub async fn establish(mut self, stop: &SignalOfStop) -> Result<OpenChannel, TransferError> {
        let mut pending_local: Vec<String> = Vec::new();
        let mut deadline = self.peer.as_ref().map(|_| Instant::now() + CONNECT_TIMEOUT);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(NegotiatorEvent::LocalCandidate(candidate)) => {
                        let payload = serde_json::to_string(&candidate)
                            .map_err(|e| TransferError::Validation(e.to_string()))?;
                        match &self.peer {
                            Some(peer) => self.signal(SignalKind::Candidate, peer, payload).await,
                            None => pending_local.push(payload),
                        }
                    }
                    Some(NegotiatorEvent::GatheringComplete) => {
                        debug!(event = "ice_gathering_complete");
                    }
                    Some(NegotiatorEvent::StateChanged(ChannelState::Failed)) => {
                        self.retry_or_fail().await?;
                        deadline = Some(Instant::now() + CONNECT_TIMEOUT);
                    }
                    Some(NegotiatorEvent::StateChanged(state)) => {
                        debug!(event = "channel_state", ?state);
                    }
                    Some(NegotiatorEvent::ChannelOpen { channel, events }) => {
                        info!(event = "channel_established", channel = %channel.label());
                        return Ok((channel, events));
                    }
                    None => return Err(TransferError::Negotiation),
                },
                envelope = self.inbox.recv() => {
                    let Some(envelope) = envelope else {
                        warn!(event = "signal_inbox_closed", "Mailbox polling ended before the peer connected");
                        return Err(TransferError::Negotiation);
                    };
                    if self.peer.is_none() {
                        info!(event = "peer_joined", peer_id = %envelope.sender_id);
                        self.peer = Some(envelope.sender_id.clone());
                        deadline = Some(Instant::now() + CONNECT_TIMEOUT);
                        for payload in pending_local.drain(..) {
                            self.signal(SignalKind::Candidate, &envelope.sender_id, payload).await;
                        }
                    }
                    self.on_envelope(envelope).await?;
                }
                _ = wait_deadline(deadline) => {
                    warn!(event = "connect_timeout", timeout_secs = CONNECT_TIMEOUT.as_secs());
                    self.retry_or_fail().await?;
                    deadline = Some(Instant::now() + CONNECT_TIMEOUT);
                }
                _ = stop.wait() => return Err(TransferError::cancelled("stopped while connecting")),
            }
        }
    }

    async fn on_envelope(&mut self, envelope: SignalingEnvelope) -> Result<(), TransferError> {
        match envelope.kind {
            SignalKind::PeerInfo => {}
            SignalKind::Offer => {
                let answer = self.negotiator.accept_offer(&envelope.payload).await.map_err(|e| {
                    warn!(event = "offer_rejected", error = %e);
                    TransferError::Negotiation
                })?;
                self.signal(SignalKind::Answer, &envelope.sender_id, answer).await;
            }
            SignalKind::Answer => {
                if let Err(e) = self.negotiator.apply_remote_answer(&envelope.payload).await {
                    warn!(event = "answer_rejected", error = %e);
                }
            }
            SignalKind::Candidate => {
                match serde_json::from_str::<RTCIceCandidateInit>(&envelope.payload) {
                    Ok(candidate) => {
                        if let Err(e) = self.negotiator.apply_remote_candidate(candidate).await {
                            warn!(event = "candidate_rejected", error = %e);
                        }
                    }
                    Err(e) => warn!(event = "candidate_malformed", error = %e),
                }
            }
        }
        Ok(())
    }

    async fn retry_or_fail(&mut self) -> Result<(), TransferError> {
        if !self.negotiator.can_retry().await {
            return Err(TransferError::Negotiation);
        }
        if !self.relay_available {
            warn!(event = "relay_unavailable", "No relay configured, not retrying");
            return Err(TransferError::Negotiation);
        }
        match self.negotiator.retry_relay_only().await {
            Ok(Some(offer)) => {
                if let Some(peer) = self.peer.clone() {
                    self.signal(SignalKind::Offer, &peer, offer).await;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(event = "relay_retry_failed", error = %e);
                Err(TransferError::Negotiation)
            }
        }
    }

    /// Post one envelope. A failed post is logged; the peer's own retries
    /// and the connect deadline cover the loss.
    async fn signal(&self, kind: SignalKind, peer: &str, payload: String) {
        if let Err(e) = self.client.send(kind, peer, payload).await {
            warn!(event = "signal_send_failed", %kind, error = %e);
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Service setup ────────────────────────────────────────────────────────────

/// Connectivity context for one run: where to signal and which servers
/// the ICE agent may use.
pub struct Service {
    pub client: SignalingClient,
    pub ice: IceServerList,
    /// `host:port` of the signaling service, for the latency probe.
    pub probe_target: Option<String>,
}

impl Service {
    /// Connect to the signaling service at `base_url`.
    ///
    /// A failed descriptor fetch is not fatal: the negotiator falls back
    /// to public STUN.
    pub async fn connect(base_url: &str) -> anyhow::Result<Self> {
        let backend = HttpBackend::new(base_url)?;
        let client = SignalingClient::new(Arc::new(backend));
        let ice = match client.ice_servers().await {
            Ok(ice) => ice,
            Err(e) => {
                warn!(event = "ice_servers_unavailable", error = %e, "Using public STUN only");
                IceServerList::default()
            }
        };
        info!(
            event = "signaling_ready",
            server = base_url,
            peer_id = client.peer_id(),
            ice_servers = ice.servers.len(),
        );
        Ok(Self {
            client,
            ice,
            probe_target: probe_target(base_url),
        })
    }

    /// Kinds of the candidates a throwaway connection gathers with the
    /// configured servers. `None` if the sample could not be taken.
    pub async fn sample_candidates(&self) -> Option<Vec<CandidateKind>> {
        match ConnectionNegotiator::sample_candidate_kinds(&self.ice.servers, PROBE_GATHER_TIMEOUT)
            .await
        {
            Ok(kinds) => Some(kinds),
            Err(e) => {
                warn!(event = "candidate_sample_failed", error = %e);
                None
            }
        }
    }

    /// Environment signals known before any network measurement.
    pub fn signals(
        &self,
        peer_flagged: bool,
        gathered: Option<&[CandidateKind]>,
    ) -> EnvironmentSignals {
        let now = chrono::Utc::now().timestamp();
        let no_stun = !self
            .ice
            .servers
            .iter()
            .any(|d| !d.is_relay() && ice::is_current(d, now));
        EnvironmentSignals {
            service_flagged: self.ice.restrictive_network,
            peer_flagged,
            no_stun,
            host_only: gathered.is_some_and(probe::host_only),
            ..Default::default()
        }
    }

    pub fn relay_available(&self) -> bool {
        ice::has_relay(&self.ice.servers, chrono::Utc::now().timestamp())
    }

    /// Probe the environment and turn the result into negotiation knobs.
    pub async fn negotiation_params(
        &self,
        peer_flagged: bool,
        gathered: Option<&[CandidateKind]>,
        config: &TransferConfig,
    ) -> (ProbeResult, NegotiationParams) {
        let probe = ConnectionNegotiator::environment_probe(
            self.signals(peer_flagged, gathered),
            self.probe_target.as_deref(),
            config.probe_threshold,
        )
        .await;
        let params = NegotiationParams::from_probe(probe, self.relay_available(), config.trickle);
        (probe, params)
    }
}
