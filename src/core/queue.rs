//! Purpose: Provide the single ordered completion queue an engine's pump drains.
//! Exports: `CompletionQueue`, `Event`, `Completion`.
//! Role: Boundary between the transport (producer) and the pump thread (sole consumer).
//! Invariants: Events are delivered strictly in post order; never reordered or batched.
//! Invariants: `next()` returns `None` only once shut down, empty, and with no armed
//! `Completion` left; cancellations issued during shutdown are therefore drained.
//! Invariants: A `Completion` posts exactly once; dropping it unfired posts a failure.
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::core::tag::Tag;

/// One completion notification. `tag == None` marks a connectivity change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Event {
    pub tag: Option<Tag>,
    pub ok: bool,
}

#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Event>,
    outstanding: usize,
    shutdown: bool,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Blocks until the next event arrives or the queue is closed and drained.
    pub fn next(&self) -> Option<Event> {
        let mut state = self.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.shutdown && state.outstanding == 0 {
                return None;
            }
            state = self
                .inner
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        self.inner.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Number of armed completions that have not posted yet.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    fn begin(&self) {
        self.lock().outstanding += 1;
    }

    fn post(&self, event: Event) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.events.push_back(event);
        self.inner.ready.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CompletionQueue")
            .field("queued", &state.events.len())
            .field("outstanding", &state.outstanding)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// An armed transport operation that will post `(tag, ok)` exactly once.
pub struct Completion {
    queue: CompletionQueue,
    tag: Option<Tag>,
    armed: bool,
}

impl Completion {
    pub fn arm(queue: &CompletionQueue, tag: Option<Tag>) -> Self {
        queue.begin();
        Self {
            queue: queue.clone(),
            tag,
            armed: true,
        }
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn complete(mut self, ok: bool) {
        self.fire(ok);
    }

    fn fire(&mut self, ok: bool) {
        if self.armed {
            self.armed = false;
            self.queue.post(Event { tag: self.tag, ok });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire(false);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("tag", &self.tag)
            .field("armed", &self.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Completion, CompletionQueue, Event};
    use crate::core::tag::{CallId, Tag, TagLabel};
    use std::thread;
    use std::time::Duration;

    fn tag(raw: u64) -> Option<Tag> {
        Some(Tag {
            call: CallId::new(raw),
            label: TagLabel::OperationComplete,
        })
    }

    #[test]
    fn events_arrive_in_post_order() {
        let queue = CompletionQueue::new();
        for raw in 1..=5 {
            Completion::arm(&queue, tag(raw)).complete(raw % 2 == 0);
        }
        for raw in 1..=5 {
            let event = queue.next().expect("event");
            assert_eq!(event, Event { tag: tag(raw), ok: raw % 2 == 0 });
        }
    }

    #[test]
    fn dropped_completion_posts_failure() {
        let queue = CompletionQueue::new();
        let completion = Completion::arm(&queue, tag(9));
        assert_eq!(queue.outstanding(), 1);
        drop(completion);
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(queue.next(), Some(Event { tag: tag(9), ok: false }));
    }

    #[test]
    fn shutdown_drains_outstanding_before_closing() {
        let queue = CompletionQueue::new();
        let completion = Completion::arm(&queue, None);
        queue.shutdown();

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.complete(true);
        });

        assert_eq!(queue.next(), Some(Event { tag: None, ok: true }));
        assert_eq!(queue.next(), None);
        producer.join().expect("join");
    }

    #[test]
    fn shutdown_of_idle_queue_closes_immediately() {
        let queue = CompletionQueue::new();
        queue.shutdown();
        assert!(queue.is_shutdown());
        assert_eq!(queue.next(), None);
    }
}
