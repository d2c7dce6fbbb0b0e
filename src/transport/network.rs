// Address directory for the in-process transport. Bind and unbind fire the watches
// registered for that address before returning, then bump a watched epoch.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tokio::sync::watch;

use crate::core::error::{Error, ErrorKind};
use crate::core::queue::Completion;
use crate::transport::server::ServerCore;

/// A connectivity watch's completion, taken by whichever side fires first.
pub(crate) type WatchSlot = Mutex<Option<Completion>>;

pub(crate) fn fire_watch(slot: &WatchSlot, ok: bool) {
    let completion = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(completion) = completion {
        completion.complete(ok);
    }
}

#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    endpoints: Mutex<HashMap<String, Arc<ServerCore>>>,
    watches: Mutex<Vec<(String, Weak<WatchSlot>)>>,
    epoch: watch::Sender<u64>,
}

impl Network {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: Mutex::new(HashMap::new()),
                watches: Mutex::new(Vec::new()),
                epoch,
            }),
        }
    }

    /// Process-wide default directory used by `AsyncClient::connect`/`AsyncServer::new`.
    pub fn global() -> &'static Network {
        static GLOBAL: OnceLock<Network> = OnceLock::new();
        GLOBAL.get_or_init(Network::new)
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.lock().contains_key(address)
    }

    pub fn bound_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub(crate) fn bind(&self, address: &str, server: &Arc<ServerCore>) -> Result<(), Error> {
        {
            let mut endpoints = self.lock();
            if endpoints.contains_key(address) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("address already bound: {address}")));
            }
            endpoints.insert(address.to_string(), Arc::clone(server));
            // Watchers post before any call can resolve the new server.
            self.wake_watches(address);
        }
        tracing::debug!(address, "bound server address");
        self.bump();
        Ok(())
    }

    /// Removes the binding only if it still belongs to `server`.
    pub(crate) fn unbind(&self, address: &str, server: &Arc<ServerCore>) {
        let removed = {
            let mut endpoints = self.lock();
            let owned = endpoints
                .get(address)
                .is_some_and(|bound| Arc::ptr_eq(bound, server));
            if owned {
                endpoints.remove(address);
                self.wake_watches(address);
            }
            owned
        };
        if removed {
            tracing::debug!(address, "unbound server address");
            self.bump();
        }
    }

    pub(crate) fn resolve(&self, address: &str) -> Option<Arc<ServerCore>> {
        self.lock().get(address).cloned()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.epoch.subscribe()
    }

    /// Registers a watch on `address`; it fires `ok = true` on the next bind or unbind.
    pub(crate) fn watch_address(&self, address: &str, slot: &Arc<WatchSlot>) {
        let mut watches = self.inner.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.retain(|(_, slot)| slot.strong_count() > 0);
        watches.push((address.to_string(), Arc::downgrade(slot)));
    }

    fn wake_watches(&self, address: &str) {
        let woken: Vec<Arc<WatchSlot>> = {
            let mut watches = self.inner.watches.lock().unwrap_or_else(PoisonError::into_inner);
            let mut woken = Vec::new();
            watches.retain(|(watched, slot)| {
                if watched != address {
                    return slot.strong_count() > 0;
                }
                woken.extend(slot.upgrade());
                false
            });
            woken
        };
        for slot in woken {
            fire_watch(&slot, true);
        }
    }

    fn bump(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerCore>>> {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("bound", &self.bound_addresses())
            .finish()
    }
}
