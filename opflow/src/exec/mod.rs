//! Runtime layer: per-context input networks, parameter-set generation, and
//! the orchestrator that drives contexts to quiescence.

pub mod network;
pub mod orchestrator;
pub mod paramset;

pub use network::{InputNetwork, Lease, LockSet};
pub use orchestrator::{ContextResult, Orchestrator, OutputMap, RunHandle};
