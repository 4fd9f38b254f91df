//! Offer/answer negotiation between two WebRTC peers.
//!
//! A [`Signaler`] drives the local peer connection through repeated negotiation rounds with
//! a remote signaler reached through a [`SignalerSet`]. Concurrent callers of
//! [`Signaler::negotiate`] are batched, simultaneous offers (glare) are settled by the
//! `priority` flag, and ICE candidates are streamed until an empty-string sentinel.
//!
//! Transports:
//! - [`loopback`] wires two signalers in the same process.
//! - [`rpc`] carries the two entry points as JSON frames over any string pipe.
//! - [`rtc::RtcPeer`] adapts a webrtc-rs `RTCPeerConnection`.

mod candidate;
mod config;
mod description;
mod error;
mod exchange;
pub mod loopback;
pub mod mock;
mod peer;
pub mod rpc;
pub mod rtc;
mod set;
mod signaler;

pub use candidate::Candidate;
pub use config::{AlterDescription, SignalerConfig};
pub use description::{SdpType, SignalDescription};
pub use error::{CONFLICT_MESSAGE, NegotiationResult, SignalError, SignalResult};
pub use peer::{CandidateSink, PeerConnection};
pub use set::SignalerSet;
pub use signaler::{QueueDepth, SignalState, Signaler, WeakSignaler};
