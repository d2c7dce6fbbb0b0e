//! Purpose: Server half of the in-process transport: method table, listeners, backlog.
//! Exports: `ServerCore`, `Incoming`.
//! Role: Matches arriving exchanges to armed `NewCall` listeners in FIFO order.
//! Invariants: An exchange is handed to at most one listener.
//! Invariants: After `shutdown()` every listener has failed and every backlogged
//! exchange has been replied `Unavailable`; new arrivals are refused the same way.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::error::{Error, ErrorKind};
use crate::core::queue::Completion;
use crate::core::status::Status;
use crate::core::tag::CallId;
use crate::transport::MethodKind;
use crate::transport::exchange::{Exchange, Reply};

/// Slot a listener's matched exchange is placed into before its `NewCall` posts.
#[derive(Clone, Default)]
pub(crate) struct Incoming(Arc<Mutex<Option<Arc<Exchange>>>>);

impl Incoming {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&self, exchange: Arc<Exchange>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(exchange);
    }

    pub fn take(&self) -> Option<Arc<Exchange>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

struct Listener {
    call: CallId,
    incoming: Incoming,
    completion: Completion,
}

struct MethodSlot {
    kind: MethodKind,
    listeners: VecDeque<Listener>,
    backlog: VecDeque<Arc<Exchange>>,
}

struct ServerState {
    running: bool,
    methods: HashMap<String, MethodSlot>,
}

pub(crate) struct ServerCore {
    state: Mutex<ServerState>,
}

impl ServerCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                running: true,
                methods: HashMap::new(),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn register_method(&self, name: &str, kind: MethodKind) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.running {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("server is shut down")
                .with_method(name));
        }
        if state.methods.contains_key(name) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("method already registered")
                .with_method(name));
        }
        state.methods.insert(
            name.to_string(),
            MethodSlot {
                kind,
                listeners: VecDeque::new(),
                backlog: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Arms a listener for `method`, or matches it at once against the backlog.
    pub fn request_call(
        &self,
        method: &str,
        call: CallId,
        incoming: Incoming,
        completion: Completion,
    ) {
        let mut state = self.lock();
        if !state.running {
            drop(state);
            completion.complete(false);
            return;
        }
        let Some(slot) = state.methods.get_mut(method) else {
            drop(state);
            completion.complete(false);
            return;
        };
        while let Some(exchange) = slot.backlog.pop_front() {
            if exchange.is_finished() {
                continue;
            }
            drop(state);
            incoming.put(exchange);
            completion.complete(true);
            return;
        }
        slot.listeners.push_back(Listener {
            call,
            incoming,
            completion,
        });
    }

    /// Fails the pending listener armed for `call`; false when none is pending.
    pub fn cancel_request(&self, call: CallId) -> bool {
        let mut state = self.lock();
        let mut cancelled = None;
        for slot in state.methods.values_mut() {
            if let Some(index) = slot.listeners.iter().position(|l| l.call == call) {
                cancelled = slot.listeners.remove(index);
                break;
            }
        }
        drop(state);
        match cancelled {
            Some(listener) => {
                listener.completion.complete(false);
                true
            }
            None => false,
        }
    }

    /// Hands an exchange arriving from a client to the next listener.
    pub fn deliver(&self, exchange: Arc<Exchange>) {
        let mut state = self.lock();
        if !state.running {
            drop(state);
            exchange.finish(Reply::status(Status::unavailable("server is shutting down")));
            return;
        }
        let Some(slot) = state.methods.get_mut(exchange.method()) else {
            drop(state);
            exchange.finish(Reply::status(Status::unimplemented("unknown method")));
            return;
        };
        if slot.kind != exchange.kind() {
            drop(state);
            exchange.finish(Reply::status(Status::unimplemented("method kind mismatch")));
            return;
        }
        match slot.listeners.pop_front() {
            Some(listener) => {
                drop(state);
                listener.incoming.put(exchange);
                listener.completion.complete(true);
            }
            None => slot.backlog.push_back(exchange),
        }
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.lock()
            .methods
            .get(method)
            .map_or(0, |slot| slot.listeners.len())
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.running = false;
        let mut listeners = Vec::new();
        let mut backlog = Vec::new();
        for slot in state.methods.values_mut() {
            listeners.extend(slot.listeners.drain(..));
            backlog.extend(slot.backlog.drain(..));
        }
        drop(state);

        for listener in listeners {
            listener.completion.complete(false);
        }
        for exchange in backlog {
            exchange.finish(Reply::status(Status::unavailable("server is shutting down")));
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
