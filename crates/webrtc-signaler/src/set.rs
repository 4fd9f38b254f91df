use async_trait::async_trait;

use crate::candidate::Candidate;
use crate::description::SignalDescription;
use crate::error::{NegotiationResult, SignalResult};

/// The remote signaler's entry points, reached through some transport.
#[async_trait]
pub trait SignalerSet: Send + Sync {
    /// Delivers a local offer to the remote `answer` entry point.
    ///
    /// [`SignalError::Conflict`](crate::SignalError::Conflict) means the remote side is
    /// offering as well and holds priority.
    async fn answer(&self, offer: SignalDescription) -> SignalResult<SignalDescription>;

    /// Delivers a batch of local candidates. An empty batch tells the remote side that its
    /// answer was rejected.
    async fn candidate_add(&self, candidates: Vec<Candidate>) -> NegotiationResult;
}
