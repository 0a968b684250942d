//! Persistence layer for the warmfront orchestration core.
//!
//! The [`Store`] trait is the seam between the orchestrator and its
//! database: [`pg::PgStore`] is the Postgres implementation used in
//! production, [`memory::MemoryStore`] a semantics-complete in-memory
//! implementation used by tests and the development profile. The
//! [`queue::ResultQueue`] sits in front of either one and coalesces
//! high-frequency task-result writes into batched transactions.

mod api;
pub mod memory;
pub mod pg;
pub mod queue;

pub use api::*;
pub use queue::{QueueHealth, ResultQueue, ResultQueueConfig, ResultQueueDriver};
