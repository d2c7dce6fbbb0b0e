//! Purpose: Client Dispatch Engine: issues calls, owns the registry, pumps completions.
//! Exports: `AsyncClient`.
//! Role: Cloneable handle over one engine; `run()` is the single pump thread.
//! Invariants: Registry, tagger, tracker, and channel change only under the engine lock.
//! Invariants: User callbacks run on the pump thread after the lock is released, except
//! the immediate `on_state_change` callback, which runs under the lock.
//! Invariants: Initiation after `shutdown()` returns `ErrorKind::Closed` and fires no callback.
//! Invariants: After `run()` returns the registry is empty and the state is `NoHostSpecified`.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use super::client_call::{CallHandle, ClientCall, ClientCallbacks, ClientStreamCall, StreamWriter, UnaryCall};
use super::server::AsyncServer;
use crate::config::EngineConfig;
use crate::core::error::{Error, ErrorKind};
use crate::core::queue::{Completion, CompletionQueue};
use crate::core::registry::Registry;
use crate::core::state::{
    CallImmediately, ConnectionState, StateTracker, to_connection_state,
};
use crate::core::tag::{Tag, TagLabel, Tagger};
use crate::transport::channel::Channel;
use crate::transport::exchange::Exchange;
use crate::transport::{Method, MethodKind, Network};

#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    queue: CompletionQueue,
    config: EngineConfig,
    target: String,
    state: Mutex<ClientState>,
}

struct ClientState {
    channel: Option<Channel>,
    tagger: Tagger,
    registry: Registry<ClientCall>,
    tracker: StateTracker,
}

impl AsyncClient {
    /// Connects to `address` on the process-wide `Network`.
    pub fn connect(address: &str) -> Self {
        Self::connect_with(Network::global(), address, EngineConfig::default())
    }

    /// An empty address yields a client fixed in `NoHostSpecified`.
    pub fn connect_with(network: &Network, address: &str, config: EngineConfig) -> Self {
        let queue = CompletionQueue::new();
        let channel = Channel::to_address(network, address);
        let initial = if address.is_empty() {
            ConnectionState::NoHostSpecified
        } else {
            let connectivity = channel.connectivity(true);
            channel.notify_on_state_change(
                connectivity,
                config.state_watch_interval(),
                Completion::arm(&queue, None),
            );
            to_connection_state(connectivity)
        };
        tracing::debug!(address, state = %initial, "client created");
        Self::assemble(queue, channel, initial, address.to_string(), config)
    }

    /// A client bound directly to a co-located server; always `AlwaysConnected`.
    pub fn in_process(server: &AsyncServer) -> Self {
        Self::in_process_with(server, EngineConfig::default())
    }

    pub fn in_process_with(server: &AsyncServer, config: EngineConfig) -> Self {
        let channel = Channel::in_process(server.core());
        Self::assemble(
            CompletionQueue::new(),
            channel,
            ConnectionState::AlwaysConnected,
            "in-process".to_string(),
            config,
        )
    }

    fn assemble(
        queue: CompletionQueue,
        channel: Channel,
        initial: ConnectionState,
        target: String,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                queue,
                config,
                target,
                state: Mutex::new(ClientState {
                    channel: Some(channel),
                    tagger: Tagger::new(),
                    registry: Registry::new(),
                    tracker: StateTracker::new(initial),
                }),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().tracker.state()
    }

    /// Number of registered calls (each has, or had, a transport operation outstanding).
    pub fn pending_calls(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Replaces the state subscriber. With `CallImmediately::Yes` the callback runs
    /// synchronously under the engine lock and must not call back into this client.
    pub fn on_state_change(
        &self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
        call_immediately: CallImmediately,
    ) {
        self.inner
            .lock()
            .tracker
            .subscribe(Arc::new(callback), call_immediately);
    }

    /// Starts a unary call. Every successful completion runs `on_response` then
    /// `on_status`; a reply without a payload yields `Resp::default()`.
    pub fn unary_rpc<Req, Resp>(
        &self,
        method: Method<Req, Resp>,
        request: Req,
        callbacks: ClientCallbacks<Resp>,
    ) -> Result<CallHandle, Error>
    where
        Req: Send + 'static,
        Resp: Default + Send + 'static,
    {
        expect_kind(&method, MethodKind::Unary)?;
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(channel) = state.channel.clone() else {
            return Err(closed(method.name()));
        };
        let id = state.tagger.next_call();
        let exchange = Exchange::unary(method.name(), Box::new(request));
        let done = state.tagger.make_tag(id, TagLabel::Done);
        exchange.await_reply(Completion::arm(&self.inner.queue, Some(done)));
        channel.start_call(Arc::clone(&exchange));

        let handle = CallHandle::new(id, &exchange);
        let call = UnaryCall::new(id, method.name(), exchange, callbacks.erase());
        state.registry.insert(id, ClientCall::Unary(call));
        tracing::debug!(call = %id, method = method.name(), "unary call started");
        Ok(handle)
    }

    /// Opens a client stream; requests are sent with the returned writer.
    pub fn client_stream_rpc<Req, Resp>(
        &self,
        method: Method<Req, Resp>,
        callbacks: ClientCallbacks<Resp>,
    ) -> Result<StreamWriter<Req>, Error>
    where
        Req: Send + 'static,
        Resp: Default + Send + 'static,
    {
        expect_kind(&method, MethodKind::ClientStream)?;
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(channel) = state.channel.as_ref() else {
            return Err(closed(method.name()));
        };
        let id = state.tagger.next_call();
        let exchange = Exchange::new(method.name(), MethodKind::ClientStream);
        let call = ClientStreamCall::open(
            id,
            method.name(),
            exchange,
            channel.downgrade(),
            &self.inner.queue,
            callbacks.erase(),
        );
        let writer = call.writer();
        state.registry.insert(id, ClientCall::ClientStream(call));
        tracing::debug!(call = %id, method = method.name(), "client stream opened");
        Ok(writer)
    }

    /// Blocks the calling thread, dispatching completions until the queue is closed
    /// and drained.
    pub fn run(&self) {
        tracing::debug!(peer = %self.inner.target, "client pump started");
        while let Some(event) = self.inner.queue.next() {
            match event.tag {
                Some(tag) => self.dispatch(tag, event.ok),
                None => self.refresh_state(),
            }
        }
        let notification = {
            let mut state = self.inner.lock();
            debug_assert!(state.registry.is_empty());
            state.tracker.close()
        };
        tracing::info!(peer = %self.inner.target, "client pump stopped");
        if let Some(notification) = notification {
            notification.deliver();
        }
    }

    /// Runs `run()` on a dedicated thread named by `EngineConfig::pump_thread_name`.
    pub fn spawn_pump(&self) -> Result<JoinHandle<()>, Error> {
        let client = self.clone();
        std::thread::Builder::new()
            .name(self.inner.config.pump_thread_name.clone())
            .spawn(move || client.run())
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn client pump")
                    .with_source(err)
            })
    }

    fn dispatch(&self, tag: Tag, ok: bool) {
        let deferred = {
            let mut state = self.inner.lock();
            let outcome = match state.registry.get_mut(tag.call) {
                Some(call) if tag.label != TagLabel::NewCall => {
                    let outcome = call.process_event(tag.label, ok);
                    debug_assert!(
                        outcome.keep || !call.has_outstanding(),
                        "finished call still has an operation in flight"
                    );
                    outcome
                }
                _ => super::unresolved_tag("client", tag),
            };
            tracing::debug!(call = %tag.call, label = ?tag.label, ok, keep = outcome.keep, "client event");
            if !outcome.keep {
                if let Some(mut call) = state.registry.remove(tag.call) {
                    call.retire();
                }
            }
            outcome.deferred
        };
        deferred.run();
    }

    fn refresh_state(&self) {
        let notification = {
            let mut state = self.inner.lock();
            let Some(channel) = state.channel.clone() else {
                return;
            };
            let connectivity = channel.connectivity(true);
            channel.notify_on_state_change(
                connectivity,
                self.inner.config.state_watch_interval(),
                Completion::arm(&self.inner.queue, None),
            );
            state.tracker.observe(to_connection_state(connectivity))
        };
        if let Some(notification) = notification {
            tracing::info!(peer = %self.inner.target, state = %notification.state(), "connection state changed");
            notification.deliver();
        }
    }

    /// Cancels outstanding calls, erases idle ones, closes the queue, and releases the
    /// channel. Never blocks; the pump drains the cancellations.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(channel) = state.channel.take() else {
            return;
        };
        state.registry.retain(|_, call| call.shutdown());
        self.inner.queue.shutdown();
        channel.shutdown();
        tracing::info!(
            peer = %self.inner.target,
            draining = state.registry.len(),
            "client shut down"
        );
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("target", &self.inner.target)
            .finish()
    }
}

fn expect_kind<Req, Resp>(method: &Method<Req, Resp>, kind: MethodKind) -> Result<(), Error> {
    if method.kind() == kind {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Usage)
        .with_message(format!("expected a {kind:?} method"))
        .with_method(method.name()))
}

fn closed(method: &str) -> Error {
    tracing::debug!(method, "call dropped: client is shut down");
    Error::new(ErrorKind::Closed)
        .with_message("client is shut down")
        .with_method(method)
}
