//! Registry layer for the AppForge build orchestrator.
//!
//! Provides in-memory implementations of the core store traits. Every state
//! transition is a check-and-set inside one critical section, so claims,
//! sweeps, and chain updates can race without ever observing partial state.
//! A transactional database backend would slot in behind the same traits.

pub mod memory;

pub use memory::{MemBuildStore, MemVmStore};
