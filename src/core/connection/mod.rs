//! Peer connection plumbing: candidate handling, connectivity-server
//! descriptors, the environment probe, the data channel transport and the
//! negotiator that ties them together.

pub mod candidate;
pub mod channel;
pub mod ice;
pub mod negotiator;
pub mod probe;

pub use channel::{ChannelEvent, RtcChannel, TransportChannel};
pub use negotiator::{ChannelState, ConnectionNegotiator, NegotiatorEvent, Role};
