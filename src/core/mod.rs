// Engine-independent primitives: queue, tags, registry, state tracking, errors.
pub mod error;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod state;
pub mod status;
pub mod tag;
