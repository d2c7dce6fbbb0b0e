// Explicit CallId -> call object map; single owner per in-flight call.
use std::collections::HashMap;

use crate::core::tag::CallId;

#[derive(Debug)]
pub struct Registry<C> {
    entries: HashMap<CallId, C>,
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers `call` under `id`, returning any entry it displaced.
    pub fn insert(&mut self, id: CallId, call: C) -> Option<C> {
        self.entries.insert(id, call)
    }

    pub fn get(&self, id: CallId) -> Option<&C> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut C> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: CallId) -> Option<C> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &C> {
        self.entries.values()
    }

    /// Keeps entries for which `keep` returns true; the rest are dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(CallId, &mut C) -> bool) {
        self.entries.retain(|id, call| keep(*id, call));
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::core::tag::CallId;

    #[test]
    fn insert_resolve_remove() {
        let mut registry = Registry::new();
        assert!(registry.insert(CallId::new(1), "a").is_none());
        assert!(registry.insert(CallId::new(2), "b").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(CallId::new(2)), Some(&"b"));

        assert_eq!(registry.remove(CallId::new(1)), Some("a"));
        assert!(!registry.contains(CallId::new(1)));
        assert!(registry.get_mut(CallId::new(1)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn retain_drops_rejected_entries() {
        let mut registry = Registry::new();
        for raw in 1..=6 {
            registry.insert(CallId::new(raw), raw);
        }
        registry.retain(|_, value| *value % 2 == 0);
        let mut kept: Vec<u64> = registry.values().copied().collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![2, 4, 6]);
    }
}
