//! Turning connectivity-server descriptors into peer connection config.
//!
//! TURN credentials are minted with a lifetime; the username carries the
//! expiry as a unix-seconds prefix (`"1718000000:alice"`). Descriptors whose
//! expiry has passed are dropped so the ICE agent never tries them.

use tracing::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::core::config::FALLBACK_STUN_URL;
use crate::core::signaling::IceServerDescriptor;

/// Expiry embedded in a time-limited username, in unix seconds.
pub fn credential_expiry(username: &str) -> Option<i64> {
    let (prefix, _) = username.split_once(':')?;
    prefix.parse().ok()
}

/// Whether `desc` can still be used at `now_unix`.
pub fn is_current(desc: &IceServerDescriptor, now_unix: i64) -> bool {
    match desc.username.as_deref().and_then(credential_expiry) {
        Some(expiry) => expiry > now_unix,
        None => true,
    }
}

/// Descriptors still valid at `now_unix`, converted for the ICE agent.
///
/// With `relay_only`, non-TURN entries are dropped as well. When nothing
/// usable remains and relay is not forced, a public STUN server is used.
pub fn usable_servers(
    descriptors: &[IceServerDescriptor],
    now_unix: i64,
    relay_only: bool,
) -> Vec<RTCIceServer> {
    let mut servers: Vec<RTCIceServer> = descriptors
        .iter()
        .filter(|d| {
            let keep = is_current(d, now_unix);
            if !keep {
                debug!(event = "ice_server_expired", urls = ?d.urls, "Dropping expired ICE credentials");
            }
            keep
        })
        .filter(|d| !relay_only || d.is_relay())
        .map(|d| RTCIceServer {
            urls: d.urls.clone(),
            username: d.username.clone().unwrap_or_default(),
            credential: d.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    if servers.is_empty() {
        if relay_only {
            warn!(event = "ice_no_relay", "Relay-only requested but no TURN server is available");
        } else {
            servers.push(RTCIceServer {
                urls: vec![FALLBACK_STUN_URL.to_string()],
                ..Default::default()
            });
        }
    }
    servers
}

/// At least one descriptor is a TURN server with current credentials.
pub fn has_relay(descriptors: &[IceServerDescriptor], now_unix: i64) -> bool {
    descriptors
        .iter()
        .any(|d| d.is_relay() && is_current(d, now_unix))
}
