use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candidate::CandidateAccumulator;
use crate::config::SignalerConfig;
use crate::description::{SdpType, SignalDescription};
use crate::error::{NegotiationResult, SignalError, SignalResult};
use crate::peer::{CandidateSink, PeerConnection};
use crate::set::SignalerSet;

/// Negotiation phase of one signaler. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    /// A local round is creating or exchanging an offer.
    Offering,
    /// The local offer lost a glare; waiting for the remote offer to arrive.
    Conceded,
    /// Answering a remote offer until both candidate streams end.
    Answering,
}

/// Whether remote candidates may be applied in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteGate {
    /// No round is running.
    Closed,
    /// A round is running but has not applied the remote description yet.
    Pending,
    Ready,
    Aborted,
}

/// What a queued caller is woken with.
pub(crate) enum Wake {
    /// Run the next round on behalf of the rest of the batch.
    Lead(Vec<Waiter>),
    Done(NegotiationResult),
}

/// Result slot created when a caller is queued; filled exactly once.
pub(crate) type Waiter = oneshot::Sender<Wake>;

pub(crate) struct State {
    pub(crate) phase: SignalState,
    pub(crate) gate: RemoteGate,
    /// Local description was set this round, so a gathering sentinel will follow.
    pub(crate) gathering: bool,
    /// The remote peer rejected our answer; stop forwarding candidates.
    pub(crate) discard_send: bool,
    /// `answer_round` is still building the answer; its send task is not registered yet.
    pub(crate) answer_pending: bool,
    pub(crate) accumulator: CandidateAccumulator,
    wait_pending: Vec<Waiter>,
    wait_simple: Vec<Waiter>,
    pub(crate) answer_send: Option<JoinHandle<NegotiationResult>>,
    pub(crate) closed: bool,
}

impl State {
    fn new() -> Self {
        Self {
            phase: SignalState::Idle,
            gate: RemoteGate::Closed,
            gathering: false,
            discard_send: false,
            answer_pending: false,
            accumulator: CandidateAccumulator::new(),
            wait_pending: Vec::new(),
            wait_simple: Vec::new(),
            answer_send: None,
            closed: false,
        }
    }

    fn begin(&mut self, phase: SignalState) {
        self.phase = phase;
        self.gate = RemoteGate::Pending;
        self.gathering = false;
        self.discard_send = false;
        self.answer_pending = false;
        self.answer_send = None;
    }

    fn end_round(&mut self) {
        self.gate = RemoteGate::Closed;
        self.gathering = false;
        self.discard_send = false;
        self.answer_pending = false;
        self.answer_send = None;
    }

    /// Hands the next round to the head of `wait_pending`, or goes idle.
    ///
    /// Returns the size of the promoted batch.
    fn advance(&mut self) -> Option<usize> {
        while !self.closed && !self.wait_pending.is_empty() {
            let head = self.wait_pending.remove(0);
            let rest = std::mem::take(&mut self.wait_pending);
            let size = rest.len() + 1;
            self.begin(SignalState::Offering);
            match head.send(Wake::Lead(rest)) {
                Ok(()) => return Some(size),
                Err(Wake::Lead(rest)) => self.wait_pending = rest,
                Err(Wake::Done(_)) => {}
            }
        }
        self.end_round();
        self.phase = SignalState::Idle;
        None
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    /// Signalled on every phase or gate transition.
    pub(crate) changed: Notify,
    pub(crate) peer: Arc<dyn PeerConnection>,
    pub(crate) remote: Arc<dyn SignalerSet>,
    pub(crate) config: SignalerConfig,
}

/// Number of local callers currently parked on the signaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Waiting for the in-flight round to finish before forming the next batch.
    pub pending: usize,
    /// Conceded to a remote offer and waiting for that round's outcome.
    pub simple: usize,
}

enum OfferRound {
    Completed,
    Conceding,
}

/// Negotiation state machine bound to one local peer connection and one remote signaler.
///
/// Cloning is cheap; every clone drives the same state.
#[derive(Clone)]
pub struct Signaler {
    pub(crate) shared: Arc<Shared>,
}

/// Non-owning handle, used by transports that point back at a signaler.
#[derive(Clone, Default)]
pub struct WeakSignaler {
    shared: Weak<Shared>,
}

impl WeakSignaler {
    pub fn upgrade(&self) -> Option<Signaler> {
        self.shared.upgrade().map(|shared| Signaler { shared })
    }
}

impl Signaler {
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        remote: Arc<dyn SignalerSet>,
        config: SignalerConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            changed: Notify::new(),
            peer,
            remote,
            config,
        });
        shared
            .peer
            .on_candidate(CandidateSink::new(Arc::downgrade(&shared)));
        Self { shared }
    }

    pub fn downgrade(&self) -> WeakSignaler {
        WeakSignaler {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn priority(&self) -> bool {
        self.shared.config.priority
    }

    pub fn state(&self) -> SignalState {
        self.shared.state.lock().phase
    }

    pub fn queued(&self) -> QueueDepth {
        let state = self.shared.state.lock();
        QueueDepth {
            pending: state.wait_pending.len(),
            simple: state.wait_simple.len(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Runs or joins a negotiation round and returns its outcome.
    ///
    /// Callers arriving while a round is in flight are queued and served together by the
    /// next round; every member of a batch gets the same result.
    pub async fn negotiate(&self) -> NegotiationResult {
        let queued = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SignalError::Closed);
            }
            if state.phase == SignalState::Idle {
                state.begin(SignalState::Offering);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.wait_pending.push(tx);
                Some((rx, state.phase, state.wait_pending.len()))
            }
        };

        let batch = match queued {
            None => Vec::new(),
            Some((rx, phase, depth)) => {
                debug!(
                    target = "signaler",
                    ?phase,
                    depth,
                    "negotiation in flight; caller queued"
                );
                match rx.await {
                    Ok(Wake::Lead(batch)) => batch,
                    Ok(Wake::Done(result)) => return result,
                    Err(_) => return Err(SignalError::Closed),
                }
            }
        };
        self.lead(batch).await
    }

    async fn lead(&self, batch: Vec<Waiter>) -> NegotiationResult {
        info!(
            target = "signaler",
            priority = self.priority(),
            batch = batch.len() + 1,
            "starting offer round"
        );
        match self.offer_round().await {
            Ok(OfferRound::Conceding) => self.concede(batch).await,
            Ok(OfferRound::Completed) => {
                self.finish_offer(&Ok(()), batch);
                Ok(())
            }
            Err(err) => {
                warn!(target = "signaler", error = %err, "offer round failed");
                self.finish_offer(&Err(err.clone()), batch);
                Err(err)
            }
        }
    }

    async fn offer_round(&self) -> SignalResult<OfferRound> {
        let mut offer = self.shared.peer.create_offer().await?;
        self.shared.config.alter(&mut offer);

        let answer = match self.shared.remote.answer(offer.clone()).await {
            Ok(answer) => answer,
            Err(SignalError::Conflict) if !self.priority() => return Ok(OfferRound::Conceding),
            Err(err) => {
                // the remote may have answered even though the reply never made it back
                self.reject_remote_answer().await;
                return Err(err);
            }
        };

        let applied = self.apply_answer(offer, answer).await;
        let (sentinel_sent, result) = match applied {
            Ok(()) => self.candidate_process_send().await,
            Err(err) => (false, Err(err)),
        };
        if let Err(err) = result {
            if !sentinel_sent {
                self.reject_remote_answer().await;
            }
            return Err(err);
        }
        Ok(OfferRound::Completed)
    }

    async fn apply_answer(
        &self,
        offer: SignalDescription,
        answer: SignalDescription,
    ) -> NegotiationResult {
        if answer.kind != SdpType::Answer {
            return Err(SignalError::Protocol(
                "remote replied to an offer with an offer".into(),
            ));
        }
        self.shared.peer.set_local_description(offer).await?;
        self.shared.state.lock().gathering = true;
        self.shared.peer.set_remote_description(answer).await?;
        self.open_remote_gate();
        Ok(())
    }

    /// Tells the remote side to drop the answer it produced for this round, then cleans up
    /// the local candidates.
    async fn reject_remote_answer(&self) {
        let gathering = {
            let mut state = self.shared.state.lock();
            state.gate = RemoteGate::Aborted;
            state.gathering
        };
        self.shared.changed.notify_waiters();
        debug!(target = "signaler", "rejecting remote answer");
        if let Err(err) = self.shared.remote.candidate_add(Vec::new()).await {
            warn!(target = "signaler", error = %err, "failed to deliver answer rejection");
        }
        if gathering {
            self.candidate_process_discard().await;
        }
    }

    /// Gives up the local offer in favour of the remote one. The whole batch, plus anyone
    /// queued meanwhile, waits for the outcome of the remote-initiated round.
    async fn concede(&self, batch: Vec<Waiter>) -> NegotiationResult {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                resolve(batch, &Err(SignalError::Closed));
                return Err(SignalError::Closed);
            }
            state.phase = SignalState::Conceded;
            state.end_round();
            state.wait_simple.push(tx);
            state.wait_simple.extend(batch);
            let pending = std::mem::take(&mut state.wait_pending);
            state.wait_simple.extend(pending);
        }
        self.shared.changed.notify_waiters();
        info!(
            target = "signaler",
            "remote offer has priority; conceding local offer"
        );
        match rx.await {
            Ok(Wake::Done(result)) => result,
            // waitSimple members are only ever resolved, never promoted
            Ok(Wake::Lead(_)) | Err(_) => Err(SignalError::Closed),
        }
    }

    fn finish_offer(&self, result: &NegotiationResult, batch: Vec<Waiter>) {
        let promoted = {
            let mut state = self.shared.state.lock();
            state.end_round();
            state.advance()
        };
        self.shared.changed.notify_waiters();
        log_advance(promoted);
        resolve(batch, result);
    }

    pub(crate) fn finish_answer(&self, result: &NegotiationResult) {
        let (simple, promoted) = {
            let mut state = self.shared.state.lock();
            if state.phase != SignalState::Answering {
                return;
            }
            state.end_round();
            let promoted = state.advance();
            (std::mem::take(&mut state.wait_simple), promoted)
        };
        self.shared.changed.notify_waiters();
        match result {
            Ok(()) => info!(target = "signaler", "answer round complete"),
            Err(err) => warn!(target = "signaler", error = %err, "answer round failed"),
        }
        log_advance(promoted);
        resolve(simple, result);
    }

    /// Entry point for a remote offer. Returns the local answer.
    pub async fn answer(&self, offer: SignalDescription) -> SignalResult<SignalDescription> {
        self.enter_answering().await?;
        match self.answer_round(offer).await {
            Ok(answer) => Ok(answer),
            Err(err) => {
                self.finish_answer(&Err(err.clone()));
                Err(err)
            }
        }
    }

    async fn enter_answering(&self) -> NegotiationResult {
        let mut deferred = false;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(SignalError::Closed);
                }
                let phase = state.phase;
                match phase {
                    SignalState::Idle | SignalState::Conceded => {
                        state.begin(SignalState::Answering);
                        state.answer_pending = true;
                        return Ok(());
                    }
                    SignalState::Offering if self.priority() => {
                        drop(state);
                        debug!(
                            target = "signaler",
                            "remote offer collides with local offer; holding priority"
                        );
                        return Err(SignalError::Conflict);
                    }
                    SignalState::Offering => {}
                    SignalState::Answering => {
                        return Err(SignalError::Protocol(
                            "remote offer while an answer is in progress".into(),
                        ));
                    }
                }
            }
            if !deferred {
                debug!(
                    target = "signaler",
                    "remote offer waits for the local offer to concede"
                );
                deferred = true;
            }
            notified.await;
        }
    }

    async fn answer_round(&self, offer: SignalDescription) -> SignalResult<SignalDescription> {
        if !offer.is_offer() {
            return Err(SignalError::Protocol(
                "answer entry point received a non-offer description".into(),
            ));
        }
        self.shared.peer.set_remote_description(offer).await?;
        self.open_remote_gate();

        let mut answer = self.shared.peer.create_answer().await?;
        self.shared.config.alter(&mut answer);
        self.shared
            .peer
            .set_local_description(answer.clone())
            .await?;

        let this = self.clone();
        let send = tokio::spawn(async move { this.candidate_exchange().await });
        {
            let mut state = self.shared.state.lock();
            state.gathering = true;
            state.answer_pending = false;
            state.answer_send = Some(send);
        }
        self.shared.changed.notify_waiters();
        debug!(target = "signaler", "answer ready; streaming local candidates");
        Ok(answer)
    }

    fn open_remote_gate(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.gate == RemoteGate::Pending {
                state.gate = RemoteGate::Ready;
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Fails every queued caller with [`SignalError::Closed`] and refuses further work.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.gate = RemoteGate::Aborted;
            state.accumulator.close();
            let mut waiters = std::mem::take(&mut state.wait_pending);
            waiters.append(&mut state.wait_simple);
            waiters
        };
        self.shared.changed.notify_waiters();
        info!(
            target = "signaler",
            released = waiters.len(),
            "signaler closed"
        );
        resolve(waiters, &Err(SignalError::Closed));
    }
}

impl fmt::Debug for Signaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Signaler")
            .field("priority", &self.shared.config.priority)
            .field("phase", &state.phase)
            .field("pending", &state.wait_pending.len())
            .field("simple", &state.wait_simple.len())
            .field("buffered_candidates", &state.accumulator.len())
            .field("candidate_consumer", &state.accumulator.is_waiting())
            .field("closed", &state.closed)
            .finish()
    }
}

fn resolve(waiters: Vec<Waiter>, result: &NegotiationResult) {
    for waiter in waiters {
        let _ = waiter.send(Wake::Done(result.clone()));
    }
}

fn log_advance(promoted: Option<usize>) {
    if let Some(batch) = promoted {
        debug!(target = "signaler", batch, "promoted queued callers to next round");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;
    use crate::loopback::pair;
    use crate::mock::{MockOp, MockPeer};
    use std::time::Duration;

    fn signalers() -> (Signaler, Arc<MockPeer>, Signaler, Arc<MockPeer>) {
        let a_peer = MockPeer::new("a");
        let b_peer = MockPeer::new("b");
        let (a, b) = pair(
            a_peer.clone(),
            SignalerConfig::new(false),
            b_peer.clone(),
            SignalerConfig::new(true),
        );
        (a, a_peer, b, b_peer)
    }

    #[tokio::test]
    async fn priority_side_refuses_a_colliding_offer() {
        let (_a, _a_peer, b, b_peer) = signalers();
        let release = b_peer.hold_next(MockOp::CreateOffer);
        let round = tokio::spawn({
            let b = b.clone();
            async move { b.negotiate().await }
        });
        while b.state() != SignalState::Offering {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = b.answer(SignalDescription::offer("v=0\r\n")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(b.state(), SignalState::Offering);

        release.send(()).unwrap();
        assert_eq!(round.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn empty_batch_outside_an_answer_round_is_ignored() {
        let (a, _a_peer, _b, _b_peer) = signalers();
        assert_eq!(a.candidate_add(Vec::new()).await, Ok(()));
        assert_eq!(a.state(), SignalState::Idle);
    }

    #[tokio::test]
    async fn rejection_waits_for_the_answer_it_refers_to() {
        let (_a, _a_peer, b, b_peer) = signalers();
        let release = b_peer.hold_next(MockOp::CreateAnswer);
        let answer = tokio::spawn({
            let b = b.clone();
            async move { b.answer(SignalDescription::offer("v=0\r\n")).await }
        });
        while b.state() != SignalState::Answering {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let rejection = tokio::spawn({
            let b = b.clone();
            async move { b.candidate_add(Vec::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!rejection.is_finished());
        assert_eq!(b.state(), SignalState::Answering);

        release.send(()).unwrap();
        assert!(!answer.await.unwrap().unwrap().is_offer());
        assert_eq!(rejection.await.unwrap(), Ok(()));
        assert_eq!(b.state(), SignalState::Idle);
    }

    #[tokio::test]
    async fn remote_candidates_need_an_active_round() {
        let (a, a_peer, _b, _b_peer) = signalers();
        let err = a
            .candidate_add(vec![Candidate::from("candidate:stray")])
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Protocol(_)));
        assert!(a_peer.remote_candidates().is_empty());
    }

    #[tokio::test]
    async fn answer_entry_point_rejects_non_offers() {
        let (a, a_peer, _b, _b_peer) = signalers();
        let err = a.answer(SignalDescription::answer("v=0\r\n")).await.unwrap_err();
        assert!(matches!(err, SignalError::Protocol(_)));
        assert_eq!(a.state(), SignalState::Idle);
        assert!(a_peer.remote_descriptions().is_empty());
    }

    #[tokio::test]
    async fn closed_signaler_refuses_new_work() {
        let (a, _a_peer, _b, _b_peer) = signalers();
        a.close();
        assert_eq!(a.negotiate().await, Err(SignalError::Closed));
        assert_eq!(
            a.answer(SignalDescription::offer("v=0\r\n")).await,
            Err(SignalError::Closed)
        );
        assert_eq!(
            a.candidate_add(vec![Candidate::end()]).await,
            Err(SignalError::Closed)
        );
        assert!(format!("{a:?}").contains("closed: true"));
    }
}
