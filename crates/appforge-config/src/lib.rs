//! KDL configuration parsing for the AppForge build orchestrator.
//!
//! This crate handles parsing of:
//! - Pool tunables (lease TTL, heartbeat TTL, prune cadence)
//! - Chain limits (max staged builds)
//! - Coordinator retry backoff

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ChainConfig, CoordinatorConfig, PoolConfig, SystemConfig, parse_system_config,
};
