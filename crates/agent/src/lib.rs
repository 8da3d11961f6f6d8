//! The agent's decision layer: when a session refresh runs and how one
//! is driven against the hosted page.

pub mod orchestrator;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;

pub use orchestrator::{RefreshOrchestrator, RefreshOutcome, RefreshTimings};
pub use scheduler::RefreshScheduler;
