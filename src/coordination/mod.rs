//! Interaction coordination
//!
//! The orchestrator:
//! 1. Plans interactions and stores them before anything is submitted
//! 2. Drives each through its phases, persisting every confirmed sub-step
//! 3. Resumes from the failed phase on retry, skipping work already on chain
//! 4. Runs at most one interaction at a time through the concurrency guard

pub mod engine;
pub mod guard;

pub use engine::Orchestrator;
pub use guard::{ConcurrencyGuard, Lease};
