use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::decoder::ValueResponse;
use crate::protocol::CoqValue;
use crate::types::{CoqError, Message};

/// What a waiter receives when its value arrives.
pub type ValueReply = Result<CoqValue, CoqError>;

/// Receivers handed back to the caller when a call is registered.
#[derive(Debug)]
pub struct PendingReply {
    pub value: oneshot::Receiver<ValueReply>,
    /// Set for calls that also wait for the next message (`Query`).
    pub message: Option<oneshot::Receiver<Message>>,
}

#[derive(Debug)]
struct PendingCall {
    call: &'static str,
    value_tx: oneshot::Sender<ValueReply>,
    message_tx: Option<oneshot::Sender<Message>>,
}

/// Matches value responses to calls in the order the calls were written.
///
/// The protocol carries no request ids: coqtop answers calls in order, so the
/// n-th value event belongs to the n-th call still outstanding. `Interrupt`
/// gets no slot of its own; coqtop answers it through the interrupted call.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: VecDeque<PendingCall>,
    /// Message slot of a call whose value already arrived.
    parked_message: Option<(&'static str, oneshot::Sender<Message>)>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Must happen before the call is written.
    pub fn register(&mut self, call: &'static str, wants_message: bool) -> PendingReply {
        let (value_tx, value) = oneshot::channel();
        let (message_tx, message) = if wants_message {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.pending.push_back(PendingCall {
            call,
            value_tx,
            message_tx,
        });
        PendingReply { value, message }
    }

    /// Number of calls still waiting for a value.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Resolve the oldest outstanding call.
    ///
    /// Returns `false` if no call was waiting; the value is then dropped.
    pub fn resolve_value(&mut self, response: ValueResponse) -> bool {
        let Some(pending) = self.pending.pop_front() else {
            return false;
        };
        let reply = match response {
            ValueResponse::Good(value) => {
                if let Some(tx) = pending.message_tx {
                    self.parked_message = Some((pending.call, tx));
                }
                Ok(value)
            }
            ValueResponse::Fail(failure) => {
                tracing::debug!(call = pending.call, %failure, "Call failed");
                Err(CoqError::Failure(failure))
            }
        };
        if pending.value_tx.send(reply).is_err() {
            tracing::debug!(call = pending.call, "Caller gone before value arrived");
        }
        true
    }

    /// Hand a message to the call waiting for one.
    ///
    /// The oldest outstanding call with a message slot wins, then a parked
    /// slot. Returns the message back if nobody claimed it.
    pub fn deliver_message(&mut self, message: Message) -> Option<Message> {
        let slot = self
            .pending
            .iter_mut()
            .find_map(|p| p.message_tx.take().map(|tx| (p.call, tx)))
            .or_else(|| self.parked_message.take());
        match slot {
            Some((call, tx)) => match tx.send(message) {
                Ok(()) => None,
                Err(message) => {
                    tracing::debug!(call, "Caller gone before message arrived");
                    Some(message)
                }
            },
            None => Some(message),
        }
    }

    /// Reject every outstanding waiter with [`CoqError::Closed`].
    pub fn fail_all(&mut self, reason: &str) {
        for pending in self.pending.drain(..) {
            let _ = pending
                .value_tx
                .send(Err(CoqError::Closed(reason.to_string())));
        }
        self.parked_message = None;
    }
}
