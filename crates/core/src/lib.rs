//! `portaljobs-core`: domain primitives of the job orchestration engine.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! identifiers, queue names, and the job state machine.

pub mod error;
pub mod id;
pub mod queue;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use queue::Queue;
pub use state::JobState;
