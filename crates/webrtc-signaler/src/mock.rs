//! Scripted peer connection for driving a [`Signaler`](crate::Signaler) without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::candidate::Candidate;
use crate::description::SignalDescription;
use crate::error::{SignalError, SignalResult};
use crate::peer::{CandidateSink, PeerConnection};

/// Peer-connection calls that can be held or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
}

#[derive(Default)]
struct Script {
    sink: Option<CandidateSink>,
    candidates: Vec<Candidate>,
    gather_delay: Duration,
    failures: HashMap<MockOp, usize>,
    holds: HashMap<MockOp, oneshot::Receiver<()>>,
    offers: usize,
    answers: usize,
    local: Vec<SignalDescription>,
    remote: Vec<SignalDescription>,
    remote_candidates: Vec<Candidate>,
}

/// Every `set_local_description` "gathers" the configured candidates, one per
/// `gather_delay`, followed by the sentinel.
pub struct MockPeer {
    name: String,
    script: Mutex<Script>,
}

impl MockPeer {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let candidates = vec![
            Candidate::new(format!("candidate:{name} 1 udp 2130706431 10.0.0.1 50000 typ host")),
            Candidate::new(format!("candidate:{name} 1 udp 1694498815 192.0.2.1 50001 typ srflx")),
        ];
        Arc::new(Self {
            name,
            script: Mutex::new(Script {
                candidates,
                gather_delay: Duration::from_millis(1),
                ..Script::default()
            }),
        })
    }

    pub fn set_candidates<I, C>(&self, candidates: I)
    where
        I: IntoIterator<Item = C>,
        C: Into<Candidate>,
    {
        self.script.lock().candidates = candidates.into_iter().map(Into::into).collect();
    }

    pub fn set_gather_delay(&self, delay: Duration) {
        self.script.lock().gather_delay = delay;
    }

    /// Makes the next call of `op` fail with [`SignalError::Peer`].
    pub fn fail_next(&self, op: MockOp) {
        *self.script.lock().failures.entry(op).or_default() += 1;
    }

    /// Parks the next call of `op` until the returned sender fires or is dropped.
    pub fn hold_next(&self, op: MockOp) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().holds.insert(op, rx);
        tx
    }

    pub fn offers_created(&self) -> usize {
        self.script.lock().offers
    }

    pub fn answers_created(&self) -> usize {
        self.script.lock().answers
    }

    pub fn local_descriptions(&self) -> Vec<SignalDescription> {
        self.script.lock().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SignalDescription> {
        self.script.lock().remote.clone()
    }

    /// Remote candidates in arrival order, sentinels included.
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.script.lock().remote_candidates.clone()
    }

    pub fn configured_candidates(&self) -> Vec<Candidate> {
        self.script.lock().candidates.clone()
    }

    async fn step(&self, op: MockOp) -> SignalResult<()> {
        let hold = self.script.lock().holds.remove(&op);
        if let Some(hold) = hold {
            let _ = hold.await;
        }
        let mut script = self.script.lock();
        match script.failures.get_mut(&op) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Err(SignalError::Peer(format!("{}: injected {op:?} failure", self.name)))
            }
            _ => Ok(()),
        }
    }

    fn start_gathering(&self) {
        let (sink, candidates, delay) = {
            let script = self.script.lock();
            (
                script.sink.clone(),
                script.candidates.clone(),
                script.gather_delay,
            )
        };
        let Some(sink) = sink else {
            return;
        };
        tokio::spawn(async move {
            for candidate in candidates {
                tokio::time::sleep(delay).await;
                sink.emit(candidate);
            }
            tokio::time::sleep(delay).await;
            sink.emit(Candidate::end());
        });
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> SignalResult<SignalDescription> {
        self.step(MockOp::CreateOffer).await?;
        let mut script = self.script.lock();
        script.offers += 1;
        Ok(SignalDescription::offer(format!(
            "v=0\r\ns={} offer {}\r\n",
            self.name, script.offers
        )))
    }

    async fn create_answer(&self) -> SignalResult<SignalDescription> {
        self.step(MockOp::CreateAnswer).await?;
        let mut script = self.script.lock();
        script.answers += 1;
        Ok(SignalDescription::answer(format!(
            "v=0\r\ns={} answer {}\r\n",
            self.name, script.answers
        )))
    }

    async fn set_local_description(&self, desc: SignalDescription) -> SignalResult<()> {
        self.step(MockOp::SetLocal).await?;
        self.script.lock().local.push(desc);
        self.start_gathering();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SignalDescription) -> SignalResult<()> {
        self.step(MockOp::SetRemote).await?;
        self.script.lock().remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> SignalResult<()> {
        self.step(MockOp::AddCandidate).await?;
        self.script.lock().remote_candidates.push(candidate);
        Ok(())
    }

    fn on_candidate(&self, sink: CandidateSink) {
        self.script.lock().sink = Some(sink);
    }
}
