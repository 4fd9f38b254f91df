#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use webrtc_signaler::loopback::LoopbackSet;
use webrtc_signaler::mock::MockPeer;
use webrtc_signaler::{
    Candidate, NegotiationResult, SignalDescription, SignalResult, Signaler, SignalerConfig,
    SignalerSet,
};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Records every call that passes through to the wrapped set.
pub struct RecordingSet {
    inner: Arc<dyn SignalerSet>,
    batches: Mutex<Vec<Vec<Candidate>>>,
    offers: Mutex<Vec<SignalDescription>>,
}

impl RecordingSet {
    pub fn new(inner: Arc<dyn SignalerSet>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            batches: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
        })
    }

    pub fn batches(&self) -> Vec<Vec<Candidate>> {
        self.batches.lock().clone()
    }

    pub fn offers(&self) -> Vec<SignalDescription> {
        self.offers.lock().clone()
    }
}

#[async_trait]
impl SignalerSet for RecordingSet {
    async fn answer(&self, offer: SignalDescription) -> SignalResult<SignalDescription> {
        self.offers.lock().push(offer.clone());
        self.inner.answer(offer).await
    }

    async fn candidate_add(&self, candidates: Vec<Candidate>) -> NegotiationResult {
        self.batches.lock().push(candidates.clone());
        self.inner.candidate_add(candidates).await
    }
}

pub struct Pair {
    pub a: Signaler,
    pub a_peer: Arc<MockPeer>,
    /// Everything `a` sends to `b`.
    pub a_to_b: Arc<RecordingSet>,
    pub b: Signaler,
    pub b_peer: Arc<MockPeer>,
    pub b_to_a: Arc<RecordingSet>,
}

/// `a` yields on glare, `b` holds priority.
pub fn mock_pair() -> Pair {
    mock_pair_with(SignalerConfig::new(false), SignalerConfig::new(true))
}

pub fn mock_pair_with(a_config: SignalerConfig, b_config: SignalerConfig) -> Pair {
    let a_peer = MockPeer::new("a");
    let b_peer = MockPeer::new("b");
    let to_b = Arc::new(LoopbackSet::new());
    let to_a = Arc::new(LoopbackSet::new());
    let a_to_b = RecordingSet::new(to_b.clone());
    let b_to_a = RecordingSet::new(to_a.clone());
    let a = Signaler::new(a_peer.clone(), a_to_b.clone(), a_config);
    let b = Signaler::new(b_peer.clone(), b_to_a.clone(), b_config);
    to_b.bind(&b);
    to_a.bind(&a);
    Pair {
        a,
        a_peer,
        a_to_b,
        b,
        b_peer,
        b_to_a,
    }
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub fn with_end(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut all = candidates;
    all.push(Candidate::end());
    all
}
