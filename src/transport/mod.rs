//! Purpose: In-process transport the dispatch engines run against.
//! Exports: `Network`, `Method`, `MethodKind`, `Payload`.
//! Role: Stands in for a real RPC transport: typed methods, an address directory,
//! connectivity watches, and completion posting through `core::queue::Completion`.
//! Invariants: Payloads are opaque here; typing happens at the engine boundary.
//! Invariants: Every armed `Completion` is eventually completed or dropped (which fails it).
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

pub(crate) mod channel;
pub(crate) mod exchange;
mod network;
pub(crate) mod server;

pub use network::Network;

/// Type-erased request or response message.
pub type Payload = Box<dyn Any + Send>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MethodKind {
    Unary,
    ClientStream,
}

/// Typed method descriptor shared by client and server code.
pub struct Method<Req, Resp> {
    name: &'static str,
    kind: MethodKind,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Method<Req, Resp> {
    pub const fn unary(name: &'static str) -> Self {
        Self {
            name,
            kind: MethodKind::Unary,
            _marker: PhantomData,
        }
    }

    pub const fn client_stream(name: &'static str) -> Self {
        Self {
            name,
            kind: MethodKind::ClientStream,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for Method<Req, Resp> {}

impl<Req, Resp> fmt::Debug for Method<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}
