//! Purpose: Completion-queue RPC dispatch library behind the `cqrpc` CLI and tests.
//! Exports: `api` (engines, callbacks, handles), `config`, `notice`, and the `core`
//! and `transport` building blocks.
//! Role: Multiplexes many in-flight calls over one ordered completion queue per engine.
//! Invariants: Only the pump thread mutates call objects and registries.
//! Invariants: Recoverable failures reach callers through callbacks, never panics.
pub mod api;
pub mod config;
pub mod core;
pub mod notice;
pub mod transport;
