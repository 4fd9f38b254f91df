mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use webrtc_signaler::loopback::LoopbackSet;
use webrtc_signaler::mock::{MockOp, MockPeer};
use webrtc_signaler::{
    Candidate, NegotiationResult, SignalDescription, SignalError, SignalResult, SignalState,
    Signaler, SignalerConfig, SignalerSet,
};

use support::{eventually, init_tracing, mock_pair, mock_pair_with, with_end};

#[test_timeout::tokio_timeout_test(10)]
async fn single_round_exchanges_descriptions_and_candidates() {
    init_tracing();
    let pair = mock_pair();

    pair.a.negotiate().await.expect("negotiation succeeds");

    assert_eq!(pair.a.state(), SignalState::Idle);
    assert_eq!(pair.b.state(), SignalState::Idle);

    let a_local = pair.a_peer.local_descriptions();
    let b_local = pair.b_peer.local_descriptions();
    assert_eq!(a_local.len(), 1);
    assert!(a_local[0].is_offer());
    assert_eq!(pair.b_peer.remote_descriptions(), a_local);
    assert_eq!(b_local.len(), 1);
    assert!(!b_local[0].is_offer());
    assert_eq!(pair.a_peer.remote_descriptions(), b_local);

    assert_eq!(
        pair.b_peer.remote_candidates(),
        with_end(pair.a_peer.configured_candidates())
    );
    assert_eq!(
        pair.a_peer.remote_candidates(),
        with_end(pair.b_peer.configured_candidates())
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn priority_side_can_initiate() {
    init_tracing();
    let pair = mock_pair();

    pair.b.negotiate().await.expect("negotiation succeeds");
    pair.a.negotiate().await.expect("second negotiation succeeds");

    assert_eq!(pair.b_peer.offers_created(), 1);
    assert_eq!(pair.a_peer.offers_created(), 1);
    assert_eq!(pair.a_peer.answers_created(), 1);
    assert_eq!(pair.b_peer.answers_created(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn callers_queued_behind_a_round_share_one_more_round() {
    init_tracing();
    let pair = mock_pair();
    let release = pair.a_peer.hold_next(MockOp::CreateOffer);

    let first = tokio::spawn({
        let a = pair.a.clone();
        async move { a.negotiate().await }
    });
    eventually(|| pair.a.state() == SignalState::Offering).await;

    let queued: Vec<_> = (0..3)
        .map(|_| {
            let a = pair.a.clone();
            tokio::spawn(async move { a.negotiate().await })
        })
        .collect();
    eventually(|| pair.a.queued().pending == 3).await;

    release.send(()).expect("round still parked");

    assert_eq!(first.await.unwrap(), Ok(()));
    for caller in queued {
        assert_eq!(caller.await.unwrap(), Ok(()));
    }
    assert_eq!(pair.a_peer.offers_created(), 2);
    assert_eq!(pair.a.queued().pending, 0);
    assert_eq!(pair.a.state(), SignalState::Idle);
}

#[test_timeout::tokio_timeout_test(10)]
async fn every_member_of_a_batch_sees_the_same_failure() {
    init_tracing();
    let pair = mock_pair();
    let release = pair.a_peer.hold_next(MockOp::CreateOffer);
    pair.a_peer.fail_next(MockOp::SetLocal);
    pair.a_peer.fail_next(MockOp::SetLocal);

    let first = tokio::spawn({
        let a = pair.a.clone();
        async move { a.negotiate().await }
    });
    eventually(|| pair.a.state() == SignalState::Offering).await;
    let queued: Vec<_> = (0..3)
        .map(|_| {
            let a = pair.a.clone();
            tokio::spawn(async move { a.negotiate().await })
        })
        .collect();
    eventually(|| pair.a.queued().pending == 3).await;
    release.send(()).expect("round still parked");

    let expected = Err(SignalError::Peer("a: injected SetLocal failure".into()));
    assert_eq!(first.await.unwrap(), expected);
    for caller in queued {
        assert_eq!(caller.await.unwrap(), expected);
    }
    assert_eq!(pair.a_peer.offers_created(), 2);

    // the pair recovers once the failures are used up
    pair.a.negotiate().await.expect("negotiation succeeds");
    assert_eq!(pair.b.state(), SignalState::Idle);
}

#[test_timeout::tokio_timeout_test(10)]
async fn glare_is_won_by_the_priority_side() {
    init_tracing();
    let pair = mock_pair();
    let release_a = pair.a_peer.hold_next(MockOp::CreateOffer);
    let release_b = pair.b_peer.hold_next(MockOp::CreateOffer);

    let a_first = tokio::spawn({
        let a = pair.a.clone();
        async move { a.negotiate().await }
    });
    let b_round = tokio::spawn({
        let b = pair.b.clone();
        async move { b.negotiate().await }
    });
    eventually(|| {
        pair.a.state() == SignalState::Offering && pair.b.state() == SignalState::Offering
    })
    .await;
    let a_second = tokio::spawn({
        let a = pair.a.clone();
        async move { a.negotiate().await }
    });
    eventually(|| pair.a.queued().pending == 1).await;

    release_a.send(()).expect("a parked");
    release_b.send(()).expect("b parked");

    assert_eq!(b_round.await.unwrap(), Ok(()));
    assert_eq!(a_first.await.unwrap(), Ok(()));
    assert_eq!(a_second.await.unwrap(), Ok(()));

    // a conceded: its offer was never applied and nothing else was offered
    assert_eq!(pair.a_peer.offers_created(), 1);
    assert_eq!(pair.a_peer.answers_created(), 1);
    assert!(pair.a_peer.local_descriptions().iter().all(|d| !d.is_offer()));
    assert_eq!(pair.b_peer.offers_created(), 1);
    assert_eq!(pair.b_peer.answers_created(), 0);
    assert_eq!(pair.a.state(), SignalState::Idle);
    assert_eq!(pair.b.state(), SignalState::Idle);
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_answer_reaches_conceded_callers() {
    init_tracing();
    let pair = mock_pair();
    let release_a = pair.a_peer.hold_next(MockOp::CreateOffer);
    let release_b = pair.b_peer.hold_next(MockOp::CreateOffer);
    pair.b_peer.fail_next(MockOp::SetRemote);

    let a_round = tokio::spawn({
        let a = pair.a.clone();
        async move { a.negotiate().await }
    });
    let b_round = tokio::spawn({
        let b = pair.b.clone();
        async move { b.negotiate().await }
    });
    eventually(|| {
        pair.a.state() == SignalState::Offering && pair.b.state() == SignalState::Offering
    })
    .await;
    release_a.send(()).expect("a parked");
    release_b.send(()).expect("b parked");

    assert_eq!(
        b_round.await.unwrap(),
        Err(SignalError::Peer("b: injected SetRemote failure".into()))
    );
    assert_eq!(a_round.await.unwrap(), Err(SignalError::PeerRejectedAnswer));

    // the rejection went out as an empty batch and nothing else crossed from b
    assert_eq!(pair.b_to_a.batches(), vec![Vec::<Candidate>::new()]);
    assert!(pair.a_peer.remote_candidates().is_empty());
    assert_eq!(pair.a.state(), SignalState::Idle);
    assert_eq!(pair.b.state(), SignalState::Idle);

    pair.a.negotiate().await.expect("pair recovers");
}

#[test_timeout::tokio_timeout_test(10)]
async fn sentinel_is_delivered_once_and_last() {
    init_tracing();
    let pair = mock_pair();
    let candidates: Vec<Candidate> = (1..=6)
        .map(|n| Candidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 4000 typ host")))
        .collect();
    pair.a_peer.set_candidates(candidates.clone());
    pair.a_peer.set_gather_delay(Duration::ZERO);

    pair.a.negotiate().await.expect("negotiation succeeds");

    let batches = pair.a_to_b.batches();
    assert!(batches.iter().all(|batch| !batch.is_empty()));
    let flat: Vec<Candidate> = batches.iter().flatten().cloned().collect();
    assert_eq!(flat, with_end(candidates));
    assert_eq!(flat.iter().filter(|c| c.is_end()).count(), 1);
    let last = batches.last().expect("at least one batch");
    assert!(last.last().is_some_and(Candidate::is_end));
}

#[test_timeout::tokio_timeout_test(10)]
async fn description_hook_applies_to_offers_and_answers() {
    init_tracing();
    let pair = mock_pair_with(
        SignalerConfig::new(false).with_alter_description(|d| d.sdp.push_str("a=x-from-a\r\n")),
        SignalerConfig::new(true).with_alter_description(|d| d.sdp.push_str("a=x-from-b\r\n")),
    );

    pair.a.negotiate().await.expect("negotiation succeeds");

    let offers = pair.a_to_b.offers();
    assert_eq!(offers.len(), 1);
    assert!(offers[0].sdp.ends_with("a=x-from-a\r\n"));
    assert_eq!(pair.a_peer.local_descriptions(), offers);
    let answer = &pair.a_peer.remote_descriptions()[0];
    assert!(answer.sdp.ends_with("a=x-from-b\r\n"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_releases_queued_callers() {
    init_tracing();
    let pair = mock_pair();
    let release = pair.a_peer.hold_next(MockOp::CreateOffer);

    let first = tokio::spawn({
        let a = pair.a.clone();
        async move { a.negotiate().await }
    });
    eventually(|| pair.a.state() == SignalState::Offering).await;
    let queued: Vec<_> = (0..2)
        .map(|_| {
            let a = pair.a.clone();
            tokio::spawn(async move { a.negotiate().await })
        })
        .collect();
    eventually(|| pair.a.queued().pending == 2).await;

    pair.a.close();
    for caller in queued {
        assert_eq!(caller.await.unwrap(), Err(SignalError::Closed));
    }

    let _ = release.send(());
    assert!(first.await.unwrap().is_err());
    assert!(pair.a.is_closed());
    assert_eq!(pair.a.negotiate().await, Err(SignalError::Closed));
    assert_eq!(pair.b.state(), SignalState::Idle);
}

#[test_timeout::tokio_timeout_test(10)]
async fn failed_candidate_round_leaves_no_stale_candidates() {
    init_tracing();
    let pair = mock_pair();
    pair.b_peer.fail_next(MockOp::AddCandidate);

    assert_eq!(
        pair.a.negotiate().await,
        Err(SignalError::Peer("b: injected AddCandidate failure".into()))
    );
    assert_eq!(pair.a.state(), SignalState::Idle);
    assert_eq!(pair.b.state(), SignalState::Idle);
    assert!(pair.b_peer.remote_candidates().is_empty());

    pair.a.negotiate().await.expect("next round succeeds");
    assert_eq!(
        pair.b_peer.remote_candidates(),
        with_end(pair.a_peer.configured_candidates())
    );
    assert_eq!(
        pair.a_peer.remote_candidates(),
        with_end(pair.b_peer.configured_candidates())
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn answer_side_failure_reaches_the_offerer() {
    init_tracing();
    let pair = mock_pair();
    pair.b_peer.fail_next(MockOp::CreateAnswer);

    assert_eq!(
        pair.a.negotiate().await,
        Err(SignalError::Peer("b: injected CreateAnswer failure".into()))
    );
    assert_eq!(pair.a.state(), SignalState::Idle);
    assert_eq!(pair.b.state(), SignalState::Idle);
    assert!(pair.a_peer.local_descriptions().is_empty());

    pair.a.negotiate().await.expect("next round succeeds");
    assert_eq!(pair.b_peer.answers_created(), 1);
    assert_eq!(
        pair.b_peer.remote_candidates(),
        with_end(pair.a_peer.configured_candidates())
    );
}

/// Delivers offers to the remote side but loses the first reply on the way back.
struct LostReplySet {
    inner: Arc<dyn SignalerSet>,
    lost: AtomicBool,
}

#[async_trait]
impl SignalerSet for LostReplySet {
    async fn answer(&self, offer: SignalDescription) -> SignalResult<SignalDescription> {
        let reply = self.inner.answer(offer).await;
        if !self.lost.swap(true, Ordering::SeqCst) {
            return Err(SignalError::Transport("reply lost".into()));
        }
        reply
    }

    async fn candidate_add(&self, candidates: Vec<Candidate>) -> NegotiationResult {
        self.inner.candidate_add(candidates).await
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn lost_answer_reply_releases_the_answering_side() {
    init_tracing();
    let a_peer = MockPeer::new("a");
    let b_peer = MockPeer::new("b");
    let to_b = Arc::new(LoopbackSet::new());
    let to_a = Arc::new(LoopbackSet::new());
    let lossy = Arc::new(LostReplySet {
        inner: to_b.clone(),
        lost: AtomicBool::new(false),
    });
    let a = Signaler::new(a_peer.clone(), lossy, SignalerConfig::new(false));
    let b = Signaler::new(b_peer.clone(), to_a.clone(), SignalerConfig::new(true));
    to_b.bind(&b);
    to_a.bind(&a);

    assert_eq!(
        a.negotiate().await,
        Err(SignalError::Transport("reply lost".into()))
    );
    assert_eq!(b_peer.answers_created(), 1);
    assert_eq!(a.state(), SignalState::Idle);
    assert_eq!(b.state(), SignalState::Idle);

    b.negotiate().await.expect("answering side can offer again");
    a.negotiate().await.expect("offering side recovers");
    assert_eq!(a.state(), SignalState::Idle);
    assert_eq!(b.state(), SignalState::Idle);
    // nothing from the abandoned answer reached a
    let round = with_end(b_peer.configured_candidates());
    assert_eq!(a_peer.remote_candidates(), [round.clone(), round].concat());
}
