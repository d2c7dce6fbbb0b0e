//! Purpose: Carry the result of routing one event to a call object.
//! Exports: `Outcome`, `Deferred`.
//! Role: Lets the pump mutate registry state under the engine lock and run user
//! callbacks only after the lock is released.
//! Invariants: Deferred callbacks run in the order they were pushed, on the pump thread.

pub type DeferredFn = Box<dyn FnOnce() + Send>;

/// Ordered batch of user callbacks captured while the engine lock was held.
#[derive(Default)]
pub struct Deferred {
    calls: Vec<DeferredFn>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call: impl FnOnce() + Send + 'static) {
        self.calls.push(Box::new(call));
    }

    pub fn append(&mut self, mut other: Deferred) {
        self.calls.append(&mut other.calls);
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn run(self) {
        for call in self.calls {
            call();
        }
    }
}

/// `keep == false` means the call reported "no further work" and must be erased.
pub struct Outcome {
    pub keep: bool,
    pub deferred: Deferred,
}

impl Outcome {
    pub fn keep(deferred: Deferred) -> Self {
        Self {
            keep: true,
            deferred,
        }
    }

    pub fn finished(deferred: Deferred) -> Self {
        Self {
            keep: false,
            deferred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Deferred;
    use std::sync::{Arc, Mutex};

    #[test]
    fn deferred_runs_in_push_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut first = Deferred::new();
        for label in ["response", "status"] {
            let seen = Arc::clone(&seen);
            first.push(move || seen.lock().expect("lock").push(label));
        }
        let mut second = Deferred::new();
        let tail = Arc::clone(&seen);
        second.push(move || tail.lock().expect("lock").push("disconnect"));
        first.append(second);

        assert_eq!(first.len(), 3);
        first.run();
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["response", "status", "disconnect"]
        );
    }
}
