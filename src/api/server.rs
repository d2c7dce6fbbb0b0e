//! Purpose: Server Dispatch Engine: method registration, listener pipeline, pump loop.
//! Exports: `AsyncServer`.
//! Role: Cloneable handle over one engine; `run()` is the single pump thread.
//! Invariants: Every registered method always has one armed listener while running;
//! a matched listener is replaced before its connect callback runs.
//! Invariants: Connect/disconnect callbacks run on the pump thread with the lock released.
//! Invariants: After `run()` returns the registry is empty.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use super::server_call::{MethodEntry, ServerCall, ServerCallbacks};
use crate::config::EngineConfig;
use crate::core::error::{Error, ErrorKind};
use crate::core::queue::{Completion, CompletionQueue};
use crate::core::registry::Registry;
use crate::core::tag::{Tag, TagLabel, Tagger};
use crate::transport::server::{Incoming, ServerCore};
use crate::transport::{Method, MethodKind, Network};

#[derive(Clone)]
pub struct AsyncServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    queue: CompletionQueue,
    core: Arc<ServerCore>,
    network: Network,
    address: String,
    config: EngineConfig,
    state: Mutex<ServerState>,
}

struct ServerState {
    running: bool,
    tagger: Tagger,
    registry: Registry<ServerCall>,
    methods: HashMap<&'static str, Arc<MethodEntry>>,
}

impl AsyncServer {
    /// Binds `address` on the process-wide `Network`; an empty address serves
    /// in-process clients only.
    pub fn new(address: &str) -> Result<Self, Error> {
        Self::bind_with(Network::global(), address, EngineConfig::default())
    }

    pub fn bind_with(network: &Network, address: &str, config: EngineConfig) -> Result<Self, Error> {
        let core = ServerCore::new();
        if !address.is_empty() {
            network.bind(address, &core)?;
        }
        tracing::debug!(address, "server created");
        Ok(Self {
            inner: Arc::new(ServerInner {
                queue: CompletionQueue::new(),
                core,
                network: network.clone(),
                address: address.to_string(),
                config,
                state: Mutex::new(ServerState {
                    running: true,
                    tagger: Tagger::new(),
                    registry: Registry::new(),
                    methods: HashMap::new(),
                }),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.inner.core
    }

    pub fn unary_rpc<Req, Resp>(
        &self,
        method: Method<Req, Resp>,
        callbacks: ServerCallbacks<Req, Resp>,
    ) -> Result<(), Error>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        expect_kind(method.name(), method.kind(), MethodKind::Unary)?;
        self.register(callbacks.unary_entry(method.name()))
    }

    /// The connect callback receives every request once the client half-closes.
    pub fn client_stream_rpc<Req, Resp>(
        &self,
        method: Method<Req, Resp>,
        callbacks: ServerCallbacks<[Req], Resp>,
    ) -> Result<(), Error>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        expect_kind(method.name(), method.kind(), MethodKind::ClientStream)?;
        self.register(callbacks.stream_entry(method.name()))
    }

    fn register(&self, entry: MethodEntry) -> Result<(), Error> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if !state.running {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("server is shut down")
                .with_method(entry.name()));
        }
        self.inner.core.register_method(entry.name(), entry.kind())?;
        let entry = Arc::new(entry);
        state.methods.insert(entry.name(), Arc::clone(&entry));
        self.inner.arm_listener(state, entry);
        Ok(())
    }

    /// Accepted calls that have not yet finished their terminal event.
    pub fn active_calls(&self) -> usize {
        self.inner
            .lock()
            .registry
            .values()
            .filter(|call| call.is_active())
            .count()
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.inner.core.listener_count(method)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Blocks the calling thread, dispatching completions until the queue is closed
    /// and drained.
    pub fn run(&self) {
        tracing::debug!(address = %self.inner.address, "server pump started");
        while let Some(event) = self.inner.queue.next() {
            match event.tag {
                Some(tag) => self.dispatch(tag, event.ok),
                None => tracing::debug!("server ignored untagged event"),
            }
        }
        debug_assert!(self.inner.lock().registry.is_empty());
        tracing::info!(address = %self.inner.address, "server pump stopped");
    }

    pub fn spawn_pump(&self) -> Result<JoinHandle<()>, Error> {
        let server = self.clone();
        std::thread::Builder::new()
            .name(self.inner.config.pump_thread_name.clone())
            .spawn(move || server.run())
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn server pump")
                    .with_source(err)
            })
    }

    fn dispatch(&self, tag: Tag, ok: bool) {
        let deferred = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let Some(entry) = state.registry.get(tag.call).map(|call| Arc::clone(call.entry())) else {
                super::unresolved_tag("server", tag);
            };
            if tag.label == TagLabel::NewCall && ok {
                if state.running {
                    self.inner.arm_listener(state, entry);
                } else if let Some(mut call) = state.registry.remove(tag.call) {
                    call.refuse();
                    return;
                }
            }
            let Some(call) = state.registry.get_mut(tag.call) else {
                super::unresolved_tag("server", tag);
            };
            let outcome = call.process_event(tag.label, ok, &self.inner.queue);
            tracing::debug!(call = %tag.call, label = ?tag.label, ok, keep = outcome.keep, "server event");
            if !outcome.keep {
                if let Some(mut call) = state.registry.remove(tag.call) {
                    call.retire();
                }
            }
            outcome.deferred
        };
        deferred.run();
    }

    /// Cancels pending listeners, retires idle accepted calls, shuts the transport
    /// down, and closes the queue. Never blocks.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if !state.running {
            return;
        }
        state.running = false;
        let core = &self.inner.core;
        state.registry.retain(|_, call| call.shutdown(core));
        core.shutdown();
        if !self.inner.address.is_empty() {
            self.inner.network.unbind(&self.inner.address, core);
        }
        self.inner.queue.shutdown();
        state.methods.clear();
        tracing::info!(
            address = %self.inner.address,
            draining = state.registry.len(),
            "server shut down"
        );
    }
}

impl ServerInner {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh listener call for `entry` and arms it with the transport.
    fn arm_listener(&self, state: &mut ServerState, entry: Arc<MethodEntry>) {
        let id = state.tagger.next_call();
        let incoming = Incoming::new();
        let tag = state.tagger.make_tag(id, TagLabel::NewCall);
        let name = entry.name();
        state
            .registry
            .insert(id, ServerCall::listening(id, entry, incoming.clone()));
        self.core
            .request_call(name, id, incoming, Completion::arm(&self.queue, Some(tag)));
    }
}

impl std::fmt::Debug for AsyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncServer")
            .field("address", &self.inner.address)
            .finish()
    }
}

fn expect_kind(name: &str, actual: MethodKind, expected: MethodKind) -> Result<(), Error> {
    if actual == expected {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Usage)
        .with_message(format!("expected a {expected:?} method"))
        .with_method(name))
}
