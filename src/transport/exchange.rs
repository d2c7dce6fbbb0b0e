//! Purpose: Hold one RPC's transport state, shared by its client and server halves.
//! Exports: `Exchange`, `Reply`, `Responder`.
//! Role: The "wire" of the in-process transport: requests flow in, one reply flows out.
//! Invariants: A reply is set at most once; the first of finish/cancel wins.
//! Invariants: The client's armed completion fires `ok = true` for any server-set
//! reply and `ok = false` when the client cancelled first.
//! Invariants: A `Responder` dropped without finishing replies `Unavailable`.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::queue::Completion;
use crate::core::status::Status;
use crate::transport::{MethodKind, Payload};

pub(crate) struct Reply {
    pub response: Option<Payload>,
    pub status: Status,
}

impl Reply {
    pub fn status(status: Status) -> Self {
        Self {
            response: None,
            status,
        }
    }
}

pub(crate) struct Exchange {
    method: String,
    kind: MethodKind,
    state: Mutex<ExchangeState>,
}

#[derive(Default)]
struct ExchangeState {
    requests: Vec<Payload>,
    half_closed: bool,
    reply: Option<Reply>,
    client_done: Option<Completion>,
    client_cancelled: bool,
}

impl Exchange {
    pub fn new(method: impl Into<String>, kind: MethodKind) -> Arc<Self> {
        Arc::new(Self {
            method: method.into(),
            kind,
            state: Mutex::new(ExchangeState::default()),
        })
    }

    /// Unary exchanges carry their single request and start half-closed.
    pub fn unary(method: impl Into<String>, request: Payload) -> Arc<Self> {
        let exchange = Self::new(method, MethodKind::Unary);
        {
            let mut state = exchange.lock();
            state.requests.push(request);
            state.half_closed = true;
        }
        exchange
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.lock().reply.is_some()
    }

    #[cfg(test)]
    pub fn is_half_closed(&self) -> bool {
        self.lock().half_closed
    }

    /// Appends one streamed request; fails once half-closed or finished.
    pub fn write(&self, request: Payload) -> bool {
        let mut state = self.lock();
        if state.half_closed || state.reply.is_some() {
            return false;
        }
        state.requests.push(request);
        true
    }

    pub fn half_close(&self) -> bool {
        let mut state = self.lock();
        if state.half_closed || state.reply.is_some() {
            return false;
        }
        state.half_closed = true;
        true
    }

    /// Arms the client's final completion; fires at once when a reply is already set.
    pub fn await_reply(&self, completion: Completion) {
        let mut state = self.lock();
        if state.reply.is_some() {
            let ok = !state.client_cancelled;
            drop(state);
            completion.complete(ok);
            return;
        }
        state.client_done = Some(completion);
    }

    pub fn take_reply(&self) -> Option<Reply> {
        self.lock().reply.take()
    }

    /// Client-side cancellation; a no-op once a reply exists.
    pub fn cancel_from_client(&self) -> bool {
        let mut state = self.lock();
        if state.reply.is_some() {
            return false;
        }
        state.client_cancelled = true;
        state.reply = Some(Reply::status(Status::cancelled("cancelled by client")));
        let pending = state.client_done.take();
        drop(state);
        if let Some(completion) = pending {
            completion.complete(false);
        }
        true
    }

    pub fn take_requests(&self) -> Vec<Payload> {
        std::mem::take(&mut self.lock().requests)
    }

    /// Sets the reply; returns false when one was already set (e.g. client cancelled).
    pub fn finish(&self, reply: Reply) -> bool {
        let mut state = self.lock();
        if state.reply.is_some() {
            return false;
        }
        state.reply = Some(reply);
        let pending = state.client_done.take();
        drop(state);
        if let Some(completion) = pending {
            completion.complete(true);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Server-side finishing handle for one accepted exchange.
pub(crate) struct Responder {
    exchange: Arc<Exchange>,
    finished: bool,
}

impl Responder {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        Self {
            exchange,
            finished: false,
        }
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Delivers the reply and completes the server's own `done` operation.
    pub fn finish(&mut self, reply: Reply, done: Completion) {
        let delivered = self.exchange.finish(reply);
        self.finished = true;
        done.complete(delivered);
    }

    pub fn cancel(&mut self, done: Completion) {
        self.exchange
            .finish(Reply::status(Status::cancelled("cancelled by server")));
        self.finished = true;
        done.complete(false);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.finished {
            self.exchange
                .finish(Reply::status(Status::unavailable("server dropped call")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Exchange, Reply, Responder};
    use crate::core::queue::{Completion, CompletionQueue, Event};
    use crate::core::status::{Status, StatusCode};
    use crate::core::tag::{CallId, Tag, TagLabel};
    use crate::transport::MethodKind;

    fn done(raw: u64) -> Option<Tag> {
        Some(Tag {
            call: CallId::new(raw),
            label: TagLabel::Done,
        })
    }

    #[test]
    fn reply_reaches_armed_client() {
        let queue = CompletionQueue::new();
        let exchange = Exchange::unary("/t/Echo", Box::new(5u32));
        exchange.await_reply(Completion::arm(&queue, done(1)));

        let requests = exchange.take_requests();
        assert_eq!(requests.len(), 1);
        assert!(exchange.finish(Reply {
            response: Some(Box::new("five")),
            status: Status::ok(),
        }));

        assert_eq!(queue.next(), Some(Event { tag: done(1), ok: true }));
        let reply = exchange.take_reply().expect("reply");
        assert!(reply.status.is_ok());
        let response = reply.response.expect("payload");
        assert_eq!(*response.downcast::<&str>().expect("type"), "five");
    }

    #[test]
    fn client_cancel_fails_completion_and_blocks_late_finish() {
        let queue = CompletionQueue::new();
        let exchange = Exchange::unary("/t/Echo", Box::new(()));
        exchange.await_reply(Completion::arm(&queue, done(2)));

        assert!(exchange.cancel_from_client());
        assert!(!exchange.cancel_from_client());
        assert_eq!(queue.next(), Some(Event { tag: done(2), ok: false }));

        let server_done = Completion::arm(&queue, done(3));
        let mut responder = Responder::new(exchange.clone());
        responder.finish(Reply::status(Status::ok()), server_done);
        assert_eq!(queue.next(), Some(Event { tag: done(3), ok: false }));
    }

    #[test]
    fn dropped_responder_replies_unavailable() {
        let exchange = Exchange::unary("/t/Echo", Box::new(()));
        drop(Responder::new(exchange.clone()));
        let reply = exchange.take_reply().expect("reply");
        assert_eq!(reply.status.code(), StatusCode::Unavailable);
    }

    #[test]
    fn stream_writes_stop_after_half_close() {
        let exchange = Exchange::new("/t/Upload", MethodKind::ClientStream);
        assert!(exchange.write(Box::new(1u8)));
        assert!(exchange.write(Box::new(2u8)));
        assert!(exchange.half_close());
        assert!(!exchange.write(Box::new(3u8)));
        assert!(exchange.is_half_closed());
        assert_eq!(exchange.take_requests().len(), 2);
    }
}
