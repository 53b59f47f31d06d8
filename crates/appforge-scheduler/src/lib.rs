//! Build orchestration for AppForge.
//!
//! Leases a scarce pool of worker VMs to build requests and serializes
//! follow-up requests per project into a dependency chain, so at most one
//! build runs per project at a time.

pub mod chain;
pub mod coordinator;
pub mod lease;
pub mod sweeper;

pub use chain::ChainManager;
pub use coordinator::{BuildEvent, Coordinator};
pub use lease::LeaseManager;
pub use sweeper::PruneSweeper;
