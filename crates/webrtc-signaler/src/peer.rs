use std::sync::Weak;

use async_trait::async_trait;
use tracing::trace;

use crate::candidate::Candidate;
use crate::description::SignalDescription;
use crate::error::SignalResult;
use crate::signaler::Shared;

/// The local peer connection as seen by the signaler.
///
/// Only the active negotiator calls the description methods, so implementations may
/// assume a single writer.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn create_offer(&self) -> SignalResult<SignalDescription>;

    async fn create_answer(&self) -> SignalResult<SignalDescription>;

    /// Setting the local description starts candidate gathering.
    async fn set_local_description(&self, desc: SignalDescription) -> SignalResult<()>;

    async fn set_remote_description(&self, desc: SignalDescription) -> SignalResult<()>;

    /// Adds a remote candidate. The sentinel marks the end of remote candidates.
    async fn add_ice_candidate(&self, candidate: Candidate) -> SignalResult<()>;

    /// Registers where locally gathered candidates go. End of gathering must be reported
    /// as [`Candidate::end`].
    fn on_candidate(&self, sink: CandidateSink);
}

/// Handle the gathering callback uses to feed a signaler's candidate accumulator.
#[derive(Clone)]
pub struct CandidateSink {
    shared: Weak<Shared>,
}

impl CandidateSink {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    pub fn emit(&self, candidate: Candidate) {
        let Some(shared) = self.shared.upgrade() else {
            trace!(target = "signaler", "dropping candidate for released signaler");
            return;
        };
        trace!(target = "signaler", candidate = %candidate, "local candidate gathered");
        shared.state.lock().accumulator.push(candidate);
    }
}

impl std::fmt::Debug for CandidateSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateSink")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}
