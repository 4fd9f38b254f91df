//! In-process wiring of two signalers.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::candidate::Candidate;
use crate::config::SignalerConfig;
use crate::description::SignalDescription;
use crate::error::{NegotiationResult, SignalError, SignalResult};
use crate::peer::PeerConnection;
use crate::set::SignalerSet;
use crate::signaler::{Signaler, WeakSignaler};

/// Calls straight into another signaler in the same process.
///
/// The remote is held weakly so two cross-wired signalers do not keep each other alive.
#[derive(Default)]
pub struct LoopbackSet {
    remote: RwLock<WeakSignaler>,
}

impl LoopbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, remote: &Signaler) {
        *self.remote.write() = remote.downgrade();
    }

    fn remote(&self) -> SignalResult<Signaler> {
        self.remote.read().upgrade().ok_or(SignalError::Closed)
    }
}

#[async_trait]
impl SignalerSet for LoopbackSet {
    async fn answer(&self, offer: SignalDescription) -> SignalResult<SignalDescription> {
        self.remote()?.answer(offer).await
    }

    async fn candidate_add(&self, candidates: Vec<Candidate>) -> NegotiationResult {
        self.remote()?.candidate_add(candidates).await
    }
}

/// Builds two signalers that reach each other directly. `a` and `b` must disagree on
/// `priority`.
pub fn pair(
    a_peer: Arc<dyn PeerConnection>,
    a_config: SignalerConfig,
    b_peer: Arc<dyn PeerConnection>,
    b_config: SignalerConfig,
) -> (Signaler, Signaler) {
    debug_assert_ne!(
        a_config.priority, b_config.priority,
        "paired signalers need opposite priorities"
    );
    let to_b = Arc::new(LoopbackSet::new());
    let to_a = Arc::new(LoopbackSet::new());
    let a = Signaler::new(a_peer, to_b.clone(), a_config);
    let b = Signaler::new(b_peer, to_a.clone(), b_config);
    to_b.bind(&b);
    to_a.bind(&a);
    (a, b)
}
