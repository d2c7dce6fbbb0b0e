//! Purpose: Public engine surface: client and server Dispatch Engines and call handles.
//! Exports: `AsyncClient`, `AsyncServer`, callback builders, writer/handle types, and
//! the shared error/status/state types callers need.
//! Role: The only public path to engine behavior; transport internals stay crate-private.
//! Invariants: A completion tag that does not resolve in a registry is fatal to the pump.

mod client;
mod client_call;
mod server;
mod server_call;
mod writer;

pub use crate::config::EngineConfig;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::state::{CallImmediately, ConnectionState};
pub use crate::core::status::{Status, StatusCode};
pub use crate::core::tag::CallId;
pub use crate::transport::{Method, MethodKind, Network};
pub use client::AsyncClient;
pub use client_call::{CallHandle, ClientCallbacks, StreamWriter};
pub use server::AsyncServer;
pub use server_call::ServerCallbacks;
pub use writer::UnaryWriter;

use crate::core::tag::Tag;

/// The transport returned a tag this engine never issued or already erased.
fn unresolved_tag(engine: &str, tag: Tag) -> ! {
    tracing::error!(engine, call = %tag.call, label = ?tag.label, "completion tag does not resolve");
    panic!("{engine} engine received unresolvable completion tag {tag}");
}
