//! Purpose: Client half of the in-process transport: a channel to an address or a
//! co-located server, plus connectivity watches.
//! Exports: `Channel`, `WeakChannel`.
//! Role: Starts exchanges against the resolved server and reports raw `Connectivity`.
//! Invariants: A shut-down channel reports `Shutdown` and refuses new exchanges with
//! `Unavailable`.
//! Invariants: A watch posts `ok = true` once connectivity differs from the caller's
//! last observation, or `ok = false` when its deadline passes first.
//! Invariants: Binding or unbinding the watched address posts the watch synchronously,
//! so it is queued ahead of any completion for a call to the new server.
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::core::queue::Completion;
use crate::core::state::Connectivity;
use crate::core::status::Status;
use crate::transport::Network;
use crate::transport::exchange::{Exchange, Reply};
use crate::transport::network::fire_watch;
use crate::transport::server::ServerCore;

enum Target {
    Address { network: Network, address: String },
    InProcess(Weak<ServerCore>),
}

#[derive(Default)]
struct Link {
    requested: bool,
    ever_ready: bool,
}

struct ChannelShared {
    target: Target,
    link: Mutex<Link>,
    closed: watch::Sender<bool>,
}

#[derive(Clone)]
pub(crate) struct Channel {
    shared: Arc<ChannelShared>,
}

/// Non-owning channel reference held by call objects; the engine may drop the channel.
#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<ChannelShared>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|shared| Channel { shared })
    }
}

impl Channel {
    pub fn to_address(network: &Network, address: &str) -> Self {
        Self::with_target(Target::Address {
            network: network.clone(),
            address: address.to_string(),
        })
    }

    pub fn in_process(server: &Arc<ServerCore>) -> Self {
        Self::with_target(Target::InProcess(Arc::downgrade(server)))
    }

    fn with_target(target: Target) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(ChannelShared {
                target,
                link: Mutex::new(Link::default()),
                closed,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.shared))
    }

    pub fn connectivity(&self, try_to_connect: bool) -> Connectivity {
        self.shared.connectivity(try_to_connect)
    }

    /// Hands a fully described exchange to whichever server the target resolves to.
    pub fn start_call(&self, exchange: Arc<Exchange>) {
        if self.shared.is_closed() {
            exchange.finish(Reply::status(Status::unavailable("channel is shut down")));
            return;
        }
        match self.shared.server() {
            Some(server) => server.deliver(exchange),
            None => {
                let message = format!("no server reachable at {}", self.shared.describe());
                exchange.finish(Reply::status(Status::unavailable(message)));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn notify_on_state_change(&self, last: Connectivity, wait: Duration, completion: Completion) {
        let Some(runtime) = watch_runtime() else {
            completion.complete(false);
            return;
        };
        let slot = Arc::new(Mutex::new(Some(completion)));
        if let Target::Address { network, address } = &self.shared.target {
            network.watch_address(address, &slot);
        }
        let shared = Arc::clone(&self.shared);
        let mut closed = self.shared.closed.subscribe();
        let mut epoch = self.shared.epoch();
        runtime.spawn(async move {
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                if shared.connectivity(false) != last {
                    fire_watch(&slot, true);
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        fire_watch(&slot, false);
                        return;
                    }
                    _ = closed.changed() => {}
                    _ = epoch_changed(&mut epoch) => {}
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shared.closed.send_replace(true);
    }
}

impl ChannelShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn describe(&self) -> String {
        match &self.target {
            Target::Address { address, .. } => address.clone(),
            Target::InProcess(_) => "in-process".to_string(),
        }
    }

    fn server(&self) -> Option<Arc<ServerCore>> {
        match &self.target {
            Target::Address { network, address } => network.resolve(address),
            Target::InProcess(server) => server.upgrade(),
        }
    }

    fn epoch(&self) -> Option<watch::Receiver<u64>> {
        match &self.target {
            Target::Address { network, .. } => Some(network.subscribe()),
            Target::InProcess(_) => None,
        }
    }

    fn connectivity(&self, try_to_connect: bool) -> Connectivity {
        if self.is_closed() {
            return Connectivity::Shutdown;
        }
        let reachable = self.server().is_some_and(|server| server.is_running());
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if reachable {
            link.requested = true;
            link.ever_ready = true;
            return Connectivity::Ready;
        }
        if link.ever_ready {
            return Connectivity::TransientFailure;
        }
        if try_to_connect {
            link.requested = true;
        }
        if link.requested {
            Connectivity::Connecting
        } else {
            Connectivity::Idle
        }
    }
}

async fn epoch_changed(epoch: &mut Option<watch::Receiver<u64>>) {
    if let Some(receiver) = epoch.as_mut() {
        if receiver.changed().await.is_ok() {
            return;
        }
        *epoch = None;
    }
    std::future::pending::<()>().await;
}

fn watch_runtime() -> Option<&'static Runtime> {
    static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("cqrpc-watch")
                .enable_time()
                .build()
                .map_err(|err| {
                    tracing::error!(error = %err, "failed to start connectivity watch runtime");
                })
                .ok()
        })
        .as_ref()
}
