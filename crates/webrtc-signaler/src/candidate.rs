use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// One ICE candidate in its wire form.
///
/// The payload is opaque to the signaler. The empty string is reserved as the
/// end-of-candidates sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(String);

impl Candidate {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    /// The end-of-candidates sentinel.
    pub fn end() -> Self {
        Self(String::new())
    }

    pub fn is_end(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for Candidate {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Candidate {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end() {
            f.write_str("<end-of-candidates>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Result of asking the accumulator for more candidates.
#[derive(Debug)]
pub(crate) enum Take {
    /// Everything buffered up to and including the first sentinel.
    Ready(Vec<Candidate>),
    /// Nothing buffered; the next gathered candidate is handed to this receiver.
    Wait(oneshot::Receiver<Candidate>),
    Closed,
}

/// Buffers locally gathered candidates until the exchange subprotocol consumes them.
///
/// Single producer (the gathering callback), at most one waiting consumer. A waiting
/// consumer is served directly, so `waiter` and a non-empty buffer never coexist.
#[derive(Debug, Default)]
pub(crate) struct CandidateAccumulator {
    buffered: VecDeque<Candidate>,
    waiter: Option<oneshot::Sender<Candidate>>,
    closed: bool,
}

impl CandidateAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, candidate: Candidate) {
        if self.closed {
            return;
        }
        let candidate = match self.waiter.take() {
            Some(waiter) => match waiter.send(candidate) {
                Ok(()) => return,
                // consumer went away; keep it for the next one
                Err(candidate) => candidate,
            },
            None => candidate,
        };
        self.buffered.push_back(candidate);
    }

    pub(crate) fn take(&mut self) -> Take {
        if !self.buffered.is_empty() {
            let end = self
                .buffered
                .iter()
                .position(Candidate::is_end)
                .map(|idx| idx + 1)
                .unwrap_or(self.buffered.len());
            return Take::Ready(self.buffered.drain(..end).collect());
        }
        if self.closed {
            return Take::Closed;
        }
        debug_assert!(self.waiter.is_none(), "accumulator supports one consumer");
        let (tx, rx) = oneshot::channel();
        self.waiter = Some(tx);
        Take::Wait(rx)
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiter.as_ref().is_some_and(|waiter| !waiter.is_closed())
    }

    pub(crate) fn len(&self) -> usize {
        self.buffered.len()
    }

    /// Drops buffered candidates and wakes a waiting consumer with a closed channel.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.waiter = None;
        self.buffered.clear();
    }
}
