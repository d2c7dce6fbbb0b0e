//! Purpose: Client-side Call Objects and the handles returned to callers.
//! Exports: `ClientCallbacks`, `CallHandle`, `StreamWriter`.
//! Role: Enum-dispatched call state (`ClientCall`) routed by the client pump.
//! Invariants: `process_event` never runs user code; callbacks are returned as `Deferred`.
//! Invariants: A client-stream call has at most one transport operation in flight;
//! the final `Done` is armed only after every queued write has completed.
//! Invariants: Handles hold weak references and degrade to no-ops returning `false`.
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::core::error::{Error, ErrorKind};
use crate::core::outcome::{Deferred, DeferredFn, Outcome};
use crate::core::queue::{Completion, CompletionQueue};
use crate::core::status::Status;
use crate::core::tag::{CallId, Tag, TagLabel};
use crate::transport::Payload;
use crate::transport::channel::WeakChannel;
use crate::transport::exchange::{Exchange, Reply};

type ResponseFn<Resp> = Box<dyn FnOnce(Resp) + Send>;
type StatusFn = Box<dyn FnOnce(Status) + Send>;
type ErrorFn = Box<dyn FnOnce(Error) + Send>;

/// User callbacks for one client call; every callback is optional.
pub struct ClientCallbacks<Resp> {
    on_response: Option<ResponseFn<Resp>>,
    on_status: Option<StatusFn>,
    on_error: Option<ErrorFn>,
}

impl<Resp> ClientCallbacks<Resp> {
    pub fn new() -> Self {
        Self {
            on_response: None,
            on_status: None,
            on_error: None,
        }
    }

    /// Runs first on every successful completion. A reply without a payload
    /// delivers `Resp::default()`.
    pub fn on_response(mut self, callback: impl FnOnce(Resp) + Send + 'static) -> Self {
        self.on_response = Some(Box::new(callback));
        self
    }

    /// Runs on every successful completion, after `on_response`.
    pub fn on_status(mut self, callback: impl FnOnce(Status) + Send + 'static) -> Self {
        self.on_status = Some(Box::new(callback));
        self
    }

    /// Runs alone when the transport reports failure (including cancellation).
    pub fn on_error(mut self, callback: impl FnOnce(Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl<Resp: Default + Send + 'static> ClientCallbacks<Resp> {
    pub(crate) fn erase(self) -> Handlers {
        let on_response = self.on_response;
        Handlers {
            decode: Box::new(move |payload: Option<Payload>| {
                let (response, matched) = match payload.map(|payload| payload.downcast::<Resp>()) {
                    Some(Ok(response)) => (*response, true),
                    Some(Err(_)) => (Resp::default(), false),
                    None => (Resp::default(), true),
                };
                let callback = on_response.map(|callback| -> DeferredFn {
                    Box::new(move || callback(response))
                });
                (callback, matched)
            }),
            on_status: self.on_status,
            on_error: self.on_error,
        }
    }
}

impl<Resp> Default for ClientCallbacks<Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Resp> fmt::Debug for ClientCallbacks<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCallbacks")
            .field("on_response", &self.on_response.is_some())
            .field("on_status", &self.on_status.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Yields the response callback and whether the payload had the expected type.
type DecodeFn = Box<dyn FnOnce(Option<Payload>) -> (Option<DeferredFn>, bool) + Send>;

/// Type-erased `ClientCallbacks`, consumed by the one terminal event.
pub(crate) struct Handlers {
    decode: DecodeFn,
    on_status: Option<StatusFn>,
    on_error: Option<ErrorFn>,
}

impl Handlers {
    fn deliver_reply(self, reply: Reply, method: &str, call: CallId, deferred: &mut Deferred) {
        let mut status = reply.status;
        let (on_response, matched) = (self.decode)(reply.response);
        if !matched {
            tracing::warn!(method, call = %call, "response payload type mismatch");
            status = Status::internal("response type mismatch");
        }
        if let Some(callback) = on_response {
            deferred.push(callback);
        }
        if let Some(callback) = self.on_status {
            deferred.push(move || callback(status));
        }
    }

    fn deliver_error(self, error: Error, deferred: &mut Deferred) {
        if let Some(callback) = self.on_error {
            deferred.push(move || callback(error));
        }
    }
}

fn transport_error(method: &str, call: CallId, message: &str) -> Error {
    Error::new(ErrorKind::Transport)
        .with_message(message)
        .with_method(method)
        .with_call(call)
}

pub(crate) enum ClientCall {
    Unary(UnaryCall),
    ClientStream(ClientStreamCall),
}

impl ClientCall {
    pub fn process_event(&mut self, label: TagLabel, ok: bool) -> Outcome {
        match self {
            ClientCall::Unary(call) => call.process_event(label, ok),
            ClientCall::ClientStream(call) => call.process_event(label, ok),
        }
    }

    pub fn has_outstanding(&self) -> bool {
        match self {
            ClientCall::Unary(call) => call.outstanding,
            ClientCall::ClientStream(call) => call.lock().has_outstanding(),
        }
    }

    /// Engine shutdown: cancels outstanding work and reports whether the entry must
    /// stay registered until that work's completion is processed.
    pub fn shutdown(&mut self) -> bool {
        match self {
            ClientCall::Unary(call) => {
                if call.outstanding {
                    call.exchange.cancel_from_client();
                }
                call.outstanding
            }
            ClientCall::ClientStream(call) => {
                let mut shared = call.lock();
                if shared.has_outstanding() {
                    shared.cancel();
                    true
                } else {
                    shared.retire();
                    false
                }
            }
        }
    }

    pub fn retire(&mut self) {
        if let ClientCall::ClientStream(call) = self {
            call.lock().retire();
        }
    }
}

pub(crate) struct UnaryCall {
    id: CallId,
    method: &'static str,
    exchange: Arc<Exchange>,
    handlers: Option<Handlers>,
    outstanding: bool,
}

impl UnaryCall {
    pub fn new(id: CallId, method: &'static str, exchange: Arc<Exchange>, handlers: Handlers) -> Self {
        Self {
            id,
            method,
            exchange,
            handlers: Some(handlers),
            outstanding: true,
        }
    }

    fn process_event(&mut self, label: TagLabel, ok: bool) -> Outcome {
        debug_assert_eq!(label, TagLabel::Done);
        self.outstanding = false;
        let mut deferred = Deferred::new();
        let Some(handlers) = self.handlers.take() else {
            return Outcome::finished(deferred);
        };
        let reply = if ok { self.exchange.take_reply() } else { None };
        match reply {
            Some(reply) => handlers.deliver_reply(reply, self.method, self.id, &mut deferred),
            None => handlers.deliver_error(
                transport_error(self.method, self.id, "rpc could not complete"),
                &mut deferred,
            ),
        }
        Outcome::finished(deferred)
    }
}

/// Stream state shared between the registered call and its `StreamWriter`s.
pub(crate) struct StreamState {
    call: CallId,
    live: bool,
    cancelled: bool,
    in_flight: bool,
    finish_requested: bool,
    finish_armed: bool,
    pending: VecDeque<Payload>,
    exchange: Arc<Exchange>,
    channel: WeakChannel,
    queue: CompletionQueue,
}

impl StreamState {
    fn operation(&self) -> Option<Tag> {
        Some(Tag {
            call: self.call,
            label: TagLabel::OperationComplete,
        })
    }

    fn post_operation(&mut self, ok: bool) {
        self.in_flight = true;
        Completion::arm(&self.queue, self.operation()).complete(ok);
    }

    fn write(&mut self, payload: Payload) -> bool {
        if !self.live || self.cancelled || self.finish_requested {
            return false;
        }
        self.pending.push_back(payload);
        if !self.in_flight {
            self.issue_next();
        }
        true
    }

    fn finish(&mut self) -> bool {
        if !self.live || self.cancelled || self.finish_requested {
            return false;
        }
        self.finish_requested = true;
        if !self.in_flight {
            self.issue_next();
        }
        true
    }

    fn cancel(&mut self) -> bool {
        if !self.live || self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.pending.clear();
        self.exchange.cancel_from_client();
        if !self.in_flight && !self.finish_armed {
            self.post_operation(false);
        }
        true
    }

    /// Starts the next queued write, or the final half-close once the queue is empty.
    fn issue_next(&mut self) {
        if let Some(payload) = self.pending.pop_front() {
            let ok = self.exchange.write(payload);
            self.post_operation(ok);
        } else if self.finish_requested && !self.finish_armed {
            self.arm_finish();
        }
    }

    fn arm_finish(&mut self) {
        self.finish_armed = true;
        self.exchange.half_close();
        let done = Tag {
            call: self.call,
            label: TagLabel::Done,
        };
        self.exchange
            .await_reply(Completion::arm(&self.queue, Some(done)));
        match self.channel.upgrade() {
            Some(channel) => channel.start_call(Arc::clone(&self.exchange)),
            None => {
                self.exchange
                    .finish(Reply::status(Status::unavailable("channel is shut down")));
            }
        }
    }

    fn has_outstanding(&self) -> bool {
        self.in_flight || self.finish_armed
    }

    fn retire(&mut self) {
        self.live = false;
        self.pending.clear();
    }
}

pub(crate) struct ClientStreamCall {
    id: CallId,
    method: &'static str,
    shared: Arc<Mutex<StreamState>>,
    handlers: Option<Handlers>,
}

impl ClientStreamCall {
    /// Builds the call and posts its open operation.
    pub fn open(
        id: CallId,
        method: &'static str,
        exchange: Arc<Exchange>,
        channel: WeakChannel,
        queue: &CompletionQueue,
        handlers: Handlers,
    ) -> Self {
        let opened = channel.upgrade().is_some_and(|channel| !channel.is_closed());
        let mut state = StreamState {
            call: id,
            live: true,
            cancelled: false,
            in_flight: false,
            finish_requested: false,
            finish_armed: false,
            pending: VecDeque::new(),
            exchange,
            channel,
            queue: queue.clone(),
        };
        state.post_operation(opened);
        Self {
            id,
            method,
            shared: Arc::new(Mutex::new(state)),
            handlers: Some(handlers),
        }
    }

    pub fn writer<Req>(&self) -> StreamWriter<Req> {
        StreamWriter {
            call: self.id,
            state: Arc::downgrade(&self.shared),
            _marker: PhantomData,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process_event(&mut self, label: TagLabel, ok: bool) -> Outcome {
        match label {
            TagLabel::Done => self.on_done(ok),
            _ => self.on_operation(ok),
        }
    }

    fn on_operation(&mut self, ok: bool) -> Outcome {
        let mut shared = self.lock();
        shared.in_flight = false;
        if !ok || shared.cancelled {
            let message = if shared.cancelled {
                "rpc cancelled"
            } else {
                "stream operation failed"
            };
            shared.retire();
            drop(shared);
            return self.fail(message);
        }
        shared.issue_next();
        Outcome::keep(Deferred::new())
    }

    fn on_done(&mut self, ok: bool) -> Outcome {
        let reply = {
            let mut shared = self.lock();
            shared.finish_armed = false;
            shared.retire();
            if ok { shared.exchange.take_reply() } else { None }
        };
        let Some(reply) = reply else {
            return self.fail("rpc could not complete");
        };
        let mut deferred = Deferred::new();
        if let Some(handlers) = self.handlers.take() {
            handlers.deliver_reply(reply, self.method, self.id, &mut deferred);
        }
        Outcome::finished(deferred)
    }

    fn fail(&mut self, message: &str) -> Outcome {
        let mut deferred = Deferred::new();
        if let Some(handlers) = self.handlers.take() {
            handlers.deliver_error(transport_error(self.method, self.id, message), &mut deferred);
        }
        Outcome::finished(deferred)
    }
}

/// Cancels one unary call from any thread.
#[derive(Clone)]
pub struct CallHandle {
    call: CallId,
    exchange: Weak<Exchange>,
}

impl CallHandle {
    pub(crate) fn new(call: CallId, exchange: &Arc<Exchange>) -> Self {
        Self {
            call,
            exchange: Arc::downgrade(exchange),
        }
    }

    pub fn id(&self) -> CallId {
        self.call
    }

    /// Requests cancellation; cleanup happens later on the pump thread.
    pub fn cancel(&self) -> bool {
        self.exchange
            .upgrade()
            .is_some_and(|exchange| exchange.cancel_from_client())
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle").field("call", &self.call).finish()
    }
}

/// Write side of a client-stream call.
pub struct StreamWriter<Req> {
    call: CallId,
    state: Weak<Mutex<StreamState>>,
    _marker: PhantomData<fn(Req)>,
}

impl<Req: Send + 'static> StreamWriter<Req> {
    pub fn call_id(&self) -> CallId {
        self.call
    }

    /// Queues one request; false once the stream was finished, cancelled, or ended.
    pub fn write(&self, request: Req) -> bool {
        self.with_state(|state| state.write(Box::new(request)))
    }

    /// Half-closes after queued writes drain and waits for the server's reply.
    pub fn finish(&self) -> bool {
        self.with_state(StreamState::finish)
    }

    pub fn cancel(&self) -> bool {
        self.with_state(StreamState::cancel)
    }

    fn with_state(&self, op: impl FnOnce(&mut StreamState) -> bool) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut state)
    }
}

impl<Req> Clone for StreamWriter<Req> {
    fn clone(&self) -> Self {
        Self {
            call: self.call,
            state: Weak::clone(&self.state),
            _marker: PhantomData,
        }
    }
}

impl<Req> fmt::Debug for StreamWriter<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("call", &self.call)
            .finish()
    }
}
