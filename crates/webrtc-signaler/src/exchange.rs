//! Candidate exchange subprotocol.
//!
//! Local candidates are drained from the accumulator and forwarded (or dropped) until the
//! end-of-candidates sentinel; remote candidates arrive through [`Signaler::candidate_add`].

use tracing::{debug, trace, warn};

use crate::candidate::{Candidate, Take};
use crate::error::{NegotiationResult, SignalError, SignalResult};
use crate::signaler::{RemoteGate, SignalState, Signaler};

impl Signaler {
    async fn next_candidates(&self) -> SignalResult<Vec<Candidate>> {
        let take = self.shared.state.lock().accumulator.take();
        match take {
            Take::Ready(batch) => Ok(batch),
            Take::Wait(rx) => rx
                .await
                .map(|candidate| vec![candidate])
                .map_err(|_| SignalError::Closed),
            Take::Closed => Err(SignalError::Closed),
        }
    }

    /// Forwards local candidates to the remote signaler until the sentinel.
    ///
    /// Returns whether the sentinel was reached along with the first error.
    pub(crate) async fn candidate_process_send(&self) -> (bool, NegotiationResult) {
        loop {
            let batch = match self.next_candidates().await {
                Ok(batch) => batch,
                Err(err) => return (false, Err(err)),
            };
            let done = batch.last().is_some_and(Candidate::is_end);
            if self.shared.state.lock().discard_send {
                return (done, Err(SignalError::PeerRejectedAnswer));
            }
            trace!(
                target = "signaler",
                count = batch.len(),
                done,
                "forwarding local candidates"
            );
            if let Err(err) = self.shared.remote.candidate_add(batch).await {
                return (done, Err(err));
            }
            if done {
                return (true, Ok(()));
            }
        }
    }

    /// Drains local candidates up to the sentinel without forwarding them.
    pub(crate) async fn candidate_process_discard(&self) {
        let mut dropped = 0usize;
        loop {
            match self.next_candidates().await {
                Ok(batch) => {
                    dropped += batch.len();
                    if batch.last().is_some_and(Candidate::is_end) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        debug!(target = "signaler", dropped, "discarded local candidates");
    }

    /// Send direction for the answering side: forward, then discard whatever is left if the
    /// send stopped short of the sentinel.
    pub(crate) async fn candidate_exchange(&self) -> NegotiationResult {
        let (done, result) = self.candidate_process_send().await;
        if !done {
            self.candidate_process_discard().await;
        }
        result
    }

    async fn wait_remote_ready(&self) -> NegotiationResult {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if state.closed {
                    return Err(SignalError::Closed);
                }
                match state.gate {
                    RemoteGate::Ready => return Ok(()),
                    RemoteGate::Pending => {}
                    RemoteGate::Aborted => {
                        return Err(SignalError::Protocol("negotiation aborted".into()));
                    }
                    RemoteGate::Closed => {
                        return Err(SignalError::Protocol(
                            "no negotiation is accepting remote candidates".into(),
                        ));
                    }
                }
            }
            notified.await;
        }
    }

    /// Entry point for a batch of remote candidates.
    ///
    /// The sentinel ends the remote stream; on the answering side that also waits for the
    /// local send to finish and closes the round. An empty batch means the remote peer
    /// rejected our answer.
    pub async fn candidate_add(&self, candidates: Vec<Candidate>) -> NegotiationResult {
        if candidates.is_empty() {
            return self.answer_rejected().await;
        }
        self.wait_remote_ready().await?;

        let mut result = Ok(());
        let mut ended = false;
        for candidate in candidates {
            let end = candidate.is_end();
            // after a failure only the sentinel is still applied, so the round can end
            if result.is_ok() || end {
                if let Err(err) = self.shared.peer.add_ice_candidate(candidate).await {
                    warn!(target = "signaler", error = %err, "failed to add remote candidate");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
            if end {
                ended = true;
                break;
            }
        }
        if !ended {
            return result;
        }
        self.remote_candidates_ended(result).await
    }

    async fn remote_candidates_ended(&self, result: NegotiationResult) -> NegotiationResult {
        let send = {
            let mut state = self.shared.state.lock();
            if state.phase != SignalState::Answering {
                // the offering side closes its round from negotiate()
                return result;
            }
            state.answer_send.take()
        };
        trace!(target = "signaler", "remote candidates complete");
        let send_result = match send {
            Some(handle) => handle.await.unwrap_or_else(|err| {
                Err(SignalError::Protocol(format!(
                    "candidate send task failed: {err}"
                )))
            }),
            None => Ok(()),
        };
        let combined = result.and(send_result);
        self.finish_answer(&combined);
        combined
    }

    async fn answer_rejected(&self) -> NegotiationResult {
        let (send, gathering) = loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(SignalError::Closed);
                }
                if state.phase != SignalState::Answering {
                    drop(state);
                    debug!(
                        target = "signaler",
                        "ignoring answer rejection outside an answer round"
                    );
                    return Ok(());
                }
                // a rejection can overtake the answer it refers to
                if !state.answer_pending {
                    state.discard_send = true;
                    state.gate = RemoteGate::Aborted;
                    break (state.answer_send.take(), state.gathering);
                }
            }
            notified.await;
        };
        self.shared.changed.notify_waiters();
        warn!(target = "signaler", "remote peer rejected our answer");
        match send {
            Some(handle) => {
                let _ = handle.await;
            }
            None if gathering => self.candidate_process_discard().await,
            None => {}
        }
        self.finish_answer(&Err(SignalError::PeerRejectedAnswer));
        Ok(())
    }
}
