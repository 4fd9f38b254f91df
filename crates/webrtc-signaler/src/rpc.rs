//! Remote signaler entry points carried as JSON frames over a pair of string channels.
//!
//! Each side owns an [`RpcSignalerSet`] for outbound calls and serves inbound calls into its
//! local [`Signaler`] through [`RpcInbound::serve`]. Both share one [`FramePipe`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::candidate::Candidate;
use crate::description::SignalDescription;
use crate::error::{NegotiationResult, SignalError, SignalResult, transport_error};
use crate::set::SignalerSet;
use crate::signaler::{Signaler, WeakSignaler};

/// Procedure names the two entry points are registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureNames {
    pub answer: String,
    pub candidate_add: String,
}

impl Default for ProcedureNames {
    fn default() -> Self {
        Self {
            answer: "signaler.answer".into(),
            candidate_add: "signaler.candidate_add".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call {
        id: u64,
        procedure: String,
        payload: Value,
    },
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    fn reply(id: u64, result: SignalResult<Value>) -> Self {
        match result {
            Ok(payload) => Frame::Reply {
                id,
                payload: Some(payload),
                error: None,
            },
            Err(err) => Frame::Reply {
                id,
                payload: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// One end of a bidirectional text channel.
#[derive(Debug)]
pub struct FramePipe {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl FramePipe {
    pub fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { tx, rx }
    }

    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        (Self::new(tx2, rx1), Self::new(tx1, rx2))
    }

    pub fn send(&self, text: String) -> SignalResult<()> {
        self.tx.send(text).map_err(transport_error)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

type ReplySlot = oneshot::Sender<SignalResult<Value>>;

#[derive(Default)]
struct Outstanding {
    calls: HashMap<u64, ReplySlot>,
    closed: bool,
}

impl Outstanding {
    fn fail_all(&mut self) -> usize {
        self.closed = true;
        let calls = std::mem::take(&mut self.calls);
        let count = calls.len();
        for (_, slot) in calls {
            let _ = slot.send(Err(SignalError::Transport("signaling pipe closed".into())));
        }
        count
    }
}

/// Outbound half: reaches the remote signaler's entry points.
pub struct RpcSignalerSet {
    tx: mpsc::UnboundedSender<String>,
    outstanding: Arc<Mutex<Outstanding>>,
    next_id: AtomicU64,
    names: ProcedureNames,
}

/// Inbound half: reads frames, completes outbound calls, and dispatches remote calls.
pub struct RpcInbound {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
    outstanding: Arc<Mutex<Outstanding>>,
    names: ProcedureNames,
}

impl RpcSignalerSet {
    pub fn new(pipe: FramePipe, names: ProcedureNames) -> (Arc<Self>, RpcInbound) {
        let FramePipe { tx, rx } = pipe;
        let outstanding = Arc::new(Mutex::new(Outstanding::default()));
        let set = Arc::new(Self {
            tx: tx.clone(),
            outstanding: outstanding.clone(),
            next_id: AtomicU64::new(1),
            names: names.clone(),
        });
        let inbound = RpcInbound {
            rx,
            tx,
            outstanding,
            names,
        };
        (set, inbound)
    }

    async fn call(&self, procedure: &str, payload: Value) -> SignalResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, reply) = oneshot::channel();
        {
            let mut outstanding = self.outstanding.lock();
            if outstanding.closed {
                return Err(SignalError::Transport("signaling pipe closed".into()));
            }
            outstanding.calls.insert(id, slot);
        }

        let frame = Frame::Call {
            id,
            procedure: procedure.to_string(),
            payload,
        };
        let sent = serde_json::to_string(&frame)
            .map_err(|err| SignalError::Protocol(err.to_string()))
            .and_then(|text| self.tx.send(text).map_err(transport_error));
        if let Err(err) = sent {
            self.outstanding.lock().calls.remove(&id);
            return Err(err);
        }
        trace!(target = "signaler", id, procedure, "rpc call sent");

        reply
            .await
            .unwrap_or_else(|_| Err(SignalError::Transport("reply slot dropped".into())))
    }
}

#[async_trait]
impl SignalerSet for RpcSignalerSet {
    async fn answer(&self, offer: SignalDescription) -> SignalResult<SignalDescription> {
        let payload = encode(&offer)?;
        let reply = self.call(&self.names.answer, payload).await?;
        decode(reply)
    }

    async fn candidate_add(&self, candidates: Vec<Candidate>) -> NegotiationResult {
        let payload = encode(&candidates)?;
        self.call(&self.names.candidate_add, payload).await?;
        Ok(())
    }
}

impl RpcInbound {
    /// Starts the reader task. Calls are dispatched to `signaler` each on their own task, so
    /// an entry point that waits on local state never stalls replies.
    pub fn serve(self, signaler: &Signaler) -> JoinHandle<()> {
        let local = signaler.downgrade();
        tokio::spawn(self.run(local))
    }

    async fn run(self, local: WeakSignaler) {
        let RpcInbound {
            mut rx,
            tx,
            outstanding,
            names,
        } = self;
        let names = Arc::new(names);

        while let Some(text) = rx.recv().await {
            let frame = match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(target = "signaler", error = %err, "dropping malformed rpc frame");
                    continue;
                }
            };
            match frame {
                Frame::Call {
                    id,
                    procedure,
                    payload,
                } => {
                    let tx = tx.clone();
                    let local = local.clone();
                    let names = names.clone();
                    tokio::spawn(async move {
                        let result = dispatch(&local, &names, &procedure, payload).await;
                        if let Err(err) = &result {
                            debug!(target = "signaler", id, procedure = %procedure, error = %err, "rpc call failed");
                        }
                        match serde_json::to_string(&Frame::reply(id, result)) {
                            Ok(text) => {
                                if tx.send(text).is_err() {
                                    debug!(target = "signaler", id, "pipe closed before reply");
                                }
                            }
                            Err(err) => {
                                warn!(target = "signaler", id, error = %err, "failed to encode reply")
                            }
                        }
                    });
                }
                Frame::Reply { id, payload, error } => {
                    let slot = outstanding.lock().calls.remove(&id);
                    let Some(slot) = slot else {
                        warn!(target = "signaler", id, "reply for unknown call");
                        continue;
                    };
                    let result = match error {
                        Some(message) => Err(SignalError::from_remote_message(&message)),
                        None => Ok(payload.unwrap_or(Value::Null)),
                    };
                    let _ = slot.send(result);
                }
            }
        }

        let failed = outstanding.lock().fail_all();
        debug!(target = "signaler", failed, "signaling pipe closed");
    }
}

async fn dispatch(
    local: &WeakSignaler,
    names: &ProcedureNames,
    procedure: &str,
    payload: Value,
) -> SignalResult<Value> {
    let signaler = local.upgrade().ok_or(SignalError::Closed)?;
    if procedure == names.answer {
        let offer: SignalDescription = decode(payload)?;
        let answer = signaler.answer(offer).await?;
        encode(&answer)
    } else if procedure == names.candidate_add {
        let candidates: Vec<Candidate> = decode(payload)?;
        signaler.candidate_add(candidates).await?;
        Ok(Value::Null)
    } else {
        Err(SignalError::Protocol(format!("unknown procedure {procedure}")))
    }
}

fn encode<T: Serialize>(value: &T) -> SignalResult<Value> {
    serde_json::to_value(value).map_err(|err| SignalError::Protocol(err.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> SignalResult<T> {
    serde_json::from_value(value)
        .map_err(|err| SignalError::Protocol(format!("malformed payload: {err}")))
}
