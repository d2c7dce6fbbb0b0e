//! Purpose: Server-side Call Objects: a listener that becomes an active call.
//! Exports: `ServerCallbacks`.
//! Role: Routed by the server pump; turns a matched `NewCall` into a connect callback
//! and the writer's `Done` into a disconnect callback.
//! Invariants: Request payloads are downcast before any user code is scheduled; a
//! mismatch finishes the call `Internal`.
//! Invariants: Without a connect handler the call is finished `Unimplemented` and no
//! user code runs.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::api::writer::{UnaryWriter, WriterState};
use crate::core::outcome::{Deferred, DeferredFn, Outcome};
use crate::core::queue::CompletionQueue;
use crate::core::status::Status;
use crate::core::tag::{CallId, Tag, TagLabel};
use crate::transport::exchange::{Reply, Responder};
use crate::transport::server::{Incoming, ServerCore};
use crate::transport::{MethodKind, Payload};

type DisconnectFn = Arc<dyn Fn(CallId) + Send + Sync>;

/// Server handlers for one method. `In` is `Req` for unary methods and `[Req]` for
/// client-stream methods, which see every streamed request at half-close.
pub struct ServerCallbacks<In: ?Sized, Resp> {
    on_connect: Option<Arc<dyn Fn(&In, UnaryWriter<Resp>) + Send + Sync>>,
    on_disconnect: Option<DisconnectFn>,
}

impl<In: ?Sized, Resp> ServerCallbacks<In, Resp> {
    pub fn new() -> Self {
        Self {
            on_connect: None,
            on_disconnect: None,
        }
    }

    pub fn on_connect(
        mut self,
        callback: impl Fn(&In, UnaryWriter<Resp>) + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    /// Runs once the writer's terminal event was processed, keyed by the call id.
    pub fn on_disconnect(mut self, callback: impl Fn(CallId) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }
}

impl<In: ?Sized, Resp> Default for ServerCallbacks<In, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: ?Sized, Resp> fmt::Debug for ServerCallbacks<In, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

type AcceptFn = Arc<
    dyn Fn(Vec<Payload>, CallId, Weak<Mutex<WriterState>>) -> Option<DeferredFn> + Send + Sync,
>;

impl<Req: Send + 'static, Resp: Send + 'static> ServerCallbacks<Req, Resp> {
    pub(crate) fn unary_entry(self, name: &'static str) -> MethodEntry {
        let accept = self.on_connect.map(|handler| -> AcceptFn {
            Arc::new(
                move |mut requests: Vec<Payload>, call: CallId, writer: Weak<Mutex<WriterState>>|
                      -> Option<DeferredFn> {
                    let request = requests.pop()?;
                    if !requests.is_empty() {
                        return None;
                    }
                    let request = *request.downcast::<Req>().ok()?;
                    let handler = Arc::clone(&handler);
                    Some(Box::new(move || handler(&request, UnaryWriter::new(call, writer))))
                },
            )
        });
        MethodEntry {
            name,
            kind: MethodKind::Unary,
            accept,
            disconnect: self.on_disconnect,
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> ServerCallbacks<[Req], Resp> {
    pub(crate) fn stream_entry(self, name: &'static str) -> MethodEntry {
        let accept = self.on_connect.map(|handler| -> AcceptFn {
            Arc::new(
                move |requests: Vec<Payload>, call: CallId, writer: Weak<Mutex<WriterState>>|
                      -> Option<DeferredFn> {
                    let requests = requests
                        .into_iter()
                        .map(|payload| payload.downcast::<Req>().map(|request| *request))
                        .collect::<Result<Vec<Req>, _>>()
                        .ok()?;
                    let handler = Arc::clone(&handler);
                    Some(Box::new(move || {
                        handler(requests.as_slice(), UnaryWriter::new(call, writer))
                    }))
                },
            )
        });
        MethodEntry {
            name,
            kind: MethodKind::ClientStream,
            accept,
            disconnect: self.on_disconnect,
        }
    }
}

/// One registered method with its type-erased handlers.
pub(crate) struct MethodEntry {
    name: &'static str,
    kind: MethodKind,
    accept: Option<AcceptFn>,
    disconnect: Option<DisconnectFn>,
}

impl MethodEntry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }
}

enum Phase {
    Listening(Incoming),
    Active(Arc<Mutex<WriterState>>),
}

pub(crate) struct ServerCall {
    id: CallId,
    entry: Arc<MethodEntry>,
    phase: Phase,
}

impl ServerCall {
    pub fn listening(id: CallId, entry: Arc<MethodEntry>, incoming: Incoming) -> Self {
        Self {
            id,
            entry,
            phase: Phase::Listening(incoming),
        }
    }

    pub fn entry(&self) -> &Arc<MethodEntry> {
        &self.entry
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active(_))
    }

    pub fn process_event(&mut self, label: TagLabel, ok: bool, queue: &CompletionQueue) -> Outcome {
        match (label, &self.phase) {
            (TagLabel::NewCall, Phase::Listening(_)) if !ok => Outcome::finished(Deferred::new()),
            (TagLabel::NewCall, Phase::Listening(incoming)) => match incoming.take() {
                Some(exchange) => self.accept(Responder::new(exchange), queue),
                None => {
                    tracing::warn!(call = %self.id, method = self.entry.name, "matched call has no exchange");
                    Outcome::finished(Deferred::new())
                }
            },
            (TagLabel::Done, Phase::Active(_)) => self.disconnect(ok),
            (label, _) => {
                tracing::error!(call = %self.id, ?label, active = self.is_active(), "event does not fit call phase");
                panic!("server call {} received {label:?} in the wrong phase", self.id);
            }
        }
    }

    fn accept(&mut self, responder: Responder, queue: &CompletionQueue) -> Outcome {
        let requests = responder.exchange().take_requests();
        let done = Tag {
            call: self.id,
            label: TagLabel::Done,
        };
        let writer = WriterState::new(responder, queue, done);
        let link = Arc::downgrade(&writer);
        self.phase = Phase::Active(Arc::clone(&writer));

        let mut deferred = Deferred::new();
        match &self.entry.accept {
            None => {
                lock_writer(&writer)
                    .finish(Reply::status(Status::unimplemented("RPC not implemented.")));
            }
            Some(accept) => match accept(requests, self.id, link) {
                Some(connect) => deferred.push(connect),
                None => {
                    tracing::warn!(call = %self.id, method = self.entry.name, "request payload type mismatch");
                    lock_writer(&writer)
                        .finish(Reply::status(Status::internal("request type mismatch")));
                }
            },
        }
        Outcome::keep(deferred)
    }

    fn disconnect(&mut self, ok: bool) -> Outcome {
        tracing::debug!(call = %self.id, method = self.entry.name, ok, "server call done");
        let mut deferred = Deferred::new();
        if let Some(callback) = &self.entry.disconnect {
            let callback = Arc::clone(callback);
            let call = self.id;
            deferred.push(move || callback(call));
        }
        Outcome::finished(deferred)
    }

    /// Replies `Unavailable` to a call matched after the engine stopped accepting.
    pub fn refuse(&mut self) {
        if let Phase::Listening(incoming) = &self.phase {
            if let Some(exchange) = incoming.take() {
                exchange.finish(Reply::status(Status::unavailable("server is shutting down")));
            }
        }
    }

    /// Engine shutdown: cancels a pending listener or retires an idle active call.
    /// Returns whether the entry must stay registered until its event arrives.
    pub fn shutdown(&mut self, core: &ServerCore) -> bool {
        match &self.phase {
            Phase::Listening(_) => {
                core.cancel_request(self.id);
                true
            }
            Phase::Active(writer) => {
                let mut writer = lock_writer(writer);
                if writer.is_outstanding() {
                    true
                } else {
                    writer.retire();
                    false
                }
            }
        }
    }

    pub fn retire(&mut self) {
        if let Phase::Active(writer) = &self.phase {
            lock_writer(writer).retire();
        }
    }
}

fn lock_writer(writer: &Arc<Mutex<WriterState>>) -> MutexGuard<'_, WriterState> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}
