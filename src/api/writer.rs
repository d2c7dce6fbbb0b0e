// Server response writer: weak handle plus liveness flag over shared writer state.
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::core::queue::{Completion, CompletionQueue};
use crate::core::status::Status;
use crate::core::tag::{CallId, Tag};
use crate::transport::Payload;
use crate::transport::exchange::{Reply, Responder};

pub(crate) struct WriterState {
    live: bool,
    outstanding: bool,
    responder: Option<Responder>,
    queue: CompletionQueue,
    done: Tag,
}

impl WriterState {
    pub fn new(responder: Responder, queue: &CompletionQueue, done: Tag) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            live: true,
            outstanding: false,
            responder: Some(responder),
            queue: queue.clone(),
            done,
        }))
    }

    /// Sends the reply and arms `Done`; false once finished, cancelled, or retired.
    pub fn finish(&mut self, reply: Reply) -> bool {
        if !self.is_ready() {
            return false;
        }
        let Some(responder) = self.responder.as_mut() else {
            return false;
        };
        responder.finish(reply, Completion::arm(&self.queue, Some(self.done)));
        self.outstanding = true;
        true
    }

    pub fn cancel(&mut self) -> bool {
        if !self.is_ready() {
            return false;
        }
        let Some(responder) = self.responder.as_mut() else {
            return false;
        };
        responder.cancel(Completion::arm(&self.queue, Some(self.done)));
        self.outstanding = true;
        true
    }

    fn is_ready(&self) -> bool {
        self.live
            && !self.outstanding
            && self
                .responder
                .as_ref()
                .is_some_and(|responder| !responder.is_finished())
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Detaches the handle side; an unfinished responder replies `Unavailable` on drop.
    pub fn retire(&mut self) {
        self.live = false;
        self.responder = None;
    }
}

/// Finishing handle passed to a server connect callback.
pub struct UnaryWriter<Resp> {
    call: CallId,
    state: Weak<Mutex<WriterState>>,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp> UnaryWriter<Resp> {
    pub(crate) fn new(call: CallId, state: Weak<Mutex<WriterState>>) -> Self {
        Self {
            call,
            state,
            _marker: PhantomData,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call
    }

    pub fn finish_with_status(&self, status: Status) -> bool {
        self.with_state(|state| state.finish(Reply::status(status)))
    }

    /// Finishes the call `Cancelled` for the client.
    pub fn cancel(&self) -> bool {
        self.with_state(WriterState::cancel)
    }

    fn with_state(&self, op: impl FnOnce(&mut WriterState) -> bool) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut state)
    }
}

impl<Resp: Send + 'static> UnaryWriter<Resp> {
    /// Delivers `response` together with `status`, whatever its code.
    pub fn finish(&self, response: Resp, status: Status) -> bool {
        let response = Some(Box::new(response) as Payload);
        self.with_state(|state| state.finish(Reply { response, status }))
    }
}

impl<Resp> Clone for UnaryWriter<Resp> {
    fn clone(&self) -> Self {
        Self::new(self.call, Weak::clone(&self.state))
    }
}

impl<Resp> fmt::Debug for UnaryWriter<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryWriter")
            .field("call", &self.call)
            .field("attached", &(self.state.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{UnaryWriter, WriterState};
    use crate::core::queue::{CompletionQueue, Event};
    use crate::core::status::{Status, StatusCode};
    use crate::core::tag::{CallId, Tag, TagLabel};
    use crate::transport::exchange::{Exchange, Responder};
    use std::sync::{Arc, PoisonError};

    fn done(raw: u64) -> Tag {
        Tag {
            call: CallId::new(raw),
            label: TagLabel::Done,
        }
    }

    #[test]
    fn finish_replies_once_and_arms_done() {
        let queue = CompletionQueue::new();
        let exchange = Exchange::unary("/t/Echo", Box::new(()));
        let state = WriterState::new(Responder::new(exchange.clone()), &queue, done(1));
        let writer = UnaryWriter::<String>::new(CallId::new(1), Arc::downgrade(&state));

        assert!(writer.finish("pong".to_string(), Status::ok()));
        assert!(!writer.finish("again".to_string(), Status::ok()));
        assert!(!writer.cancel());
        assert_eq!(queue.next(), Some(Event { tag: Some(done(1)), ok: true }));

        let reply = exchange.take_reply().expect("reply");
        let response = reply.response.expect("payload");
        assert_eq!(*response.downcast::<String>().expect("type"), "pong");
    }

    #[test]
    fn error_status_keeps_payload() {
        let queue = CompletionQueue::new();
        let exchange = Exchange::unary("/t/Echo", Box::new(()));
        let state = WriterState::new(Responder::new(exchange.clone()), &queue, done(2));
        let writer = UnaryWriter::<u8>::new(CallId::new(2), Arc::downgrade(&state));
        assert!(writer.finish(1, Status::internal("boom")));
        let reply = exchange.take_reply().expect("reply");
        assert_eq!(*reply.response.expect("payload").downcast::<u8>().expect("type"), 1);
        assert_eq!(reply.status.code(), StatusCode::Internal);
    }

    #[test]
    fn retired_or_dropped_state_makes_writer_inert() {
        let queue = CompletionQueue::new();
        let exchange = Exchange::unary("/t/Echo", Box::new(()));
        let state = WriterState::new(Responder::new(exchange.clone()), &queue, done(3));
        let writer = UnaryWriter::<u8>::new(CallId::new(3), Arc::downgrade(&state));

        state.lock().unwrap_or_else(PoisonError::into_inner).retire();
        assert!(!writer.finish(1, Status::ok()));
        assert_eq!(
            exchange.take_reply().expect("reply").status.code(),
            StatusCode::Unavailable
        );

        drop(state);
        assert!(!writer.cancel());
        assert_eq!(queue.outstanding(), 0);
    }
}
