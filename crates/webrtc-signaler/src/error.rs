use thiserror::Error;

/// Message carried on the wire when the remote side wins a glare.
pub const CONFLICT_MESSAGE: &str = "negotiation conflict";
const PEER_REJECTED_MESSAGE: &str = "peer rejected answer";
const CLOSED_MESSAGE: &str = "signaler closed";

/// Errors produced by a negotiation round.
///
/// Every member of a batch receives a clone of the same value, so payloads are kept as
/// plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// The remote side is offering too and holds priority.
    #[error("negotiation conflict")]
    Conflict,
    /// The offering side discarded the answer this side produced.
    #[error("peer rejected answer")]
    PeerRejectedAnswer,
    #[error("signaler closed")]
    Closed,
    #[error("signaling transport failed: {0}")]
    Transport(String),
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("remote signaler error: {0}")]
    Remote(String),
    #[error("signaling protocol violation: {0}")]
    Protocol(String),
}

pub type SignalResult<T> = Result<T, SignalError>;

/// Outcome shared by every caller batched into one negotiation round.
pub type NegotiationResult = SignalResult<()>;

impl SignalError {
    /// Rebuilds an error from the message a remote signaler reported.
    pub fn from_remote_message(message: &str) -> Self {
        match message {
            CONFLICT_MESSAGE => SignalError::Conflict,
            PEER_REJECTED_MESSAGE => SignalError::PeerRejectedAnswer,
            CLOSED_MESSAGE => SignalError::Closed,
            other => SignalError::Remote(other.to_string()),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SignalError::Conflict)
    }
}

pub(crate) fn peer_error(err: impl std::error::Error) -> SignalError {
    SignalError::Peer(err.to_string())
}

pub(crate) fn transport_error(err: impl std::fmt::Display) -> SignalError {
    SignalError::Transport(err.to_string())
}
