//! System configuration parsing.
//!
//! Example document:
//!
//! ```kdl
//! pool {
//!     lease-ttl-secs 900
//!     heartbeat-ttl-secs 90
//!     prune-interval-secs 30
//!     reclaim-expired-leases #false
//! }
//! chain {
//!     max-staged-builds 3
//! }
//! coordinator {
//!     claim-retry-initial-ms 500
//!     claim-retry-max-ms 30000
//!     claim-retry-attempts 10
//! }
//! ```
//!
//! Every field is optional; unknown nodes are ignored.

use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub pool: PoolConfig,
    pub chain: ChainConfig,
    pub coordinator: CoordinatorConfig,
}

/// VM pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum busy duration before a lease is eligible for reclaim.
    pub lease_ttl_secs: u64,
    /// Heartbeat staleness window before a VM is pruned.
    pub heartbeat_ttl_secs: u64,
    /// Cadence of the background prune sweep.
    pub prune_interval_secs: u64,
    /// Whether the sweeper also reclaims expired leases. Safety net,
    /// off by default.
    pub reclaim_expired_leases: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 900,
            heartbeat_ttl_secs: 90,
            prune_interval_secs: 30,
            reclaim_expired_leases: false,
        }
    }
}

impl PoolConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Build chain limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Maximum staged builds per project.
    pub max_staged_builds: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_staged_builds: 3,
        }
    }
}

/// Coordinator claim-retry backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// First retry delay after a failed claim.
    pub claim_retry_initial_ms: u64,
    /// Backoff ceiling.
    pub claim_retry_max_ms: u64,
    /// Retry attempts before giving up.
    pub claim_retry_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_retry_initial_ms: 500,
            claim_retry_max_ms: 30_000,
            claim_retry_attempts: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn claim_retry_initial(&self) -> Duration {
        Duration::from_millis(self.claim_retry_initial_ms)
    }

    pub fn claim_retry_max(&self) -> Duration {
        Duration::from_millis(self.claim_retry_max_ms)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "pool" => parse_pool(node, &mut config.pool)?,
            "chain" => parse_chain(node, &mut config.chain)?,
            "coordinator" => parse_coordinator(node, &mut config.coordinator)?,
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn parse_pool(node: &KdlNode, pool: &mut PoolConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "lease-ttl-secs" => pool.lease_ttl_secs = get_int_arg(child)?,
                "heartbeat-ttl-secs" => pool.heartbeat_ttl_secs = get_int_arg(child)?,
                "prune-interval-secs" => pool.prune_interval_secs = get_int_arg(child)?,
                "reclaim-expired-leases" => pool.reclaim_expired_leases = get_bool_arg(child)?,
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_chain(node: &KdlNode, chain: &mut ChainConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "max-staged-builds" {
                chain.max_staged_builds = get_int_arg(child)? as usize;
            }
        }
    }
    Ok(())
}

fn parse_coordinator(node: &KdlNode, coordinator: &mut CoordinatorConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "claim-retry-initial-ms" => {
                    coordinator.claim_retry_initial_ms = get_int_arg(child)?
                }
                "claim-retry-max-ms" => coordinator.claim_retry_max_ms = get_int_arg(child)?,
                "claim-retry-attempts" => {
                    coordinator.claim_retry_attempts = get_int_arg(child)? as u32
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn validate(config: &SystemConfig) -> ConfigResult<()> {
    if config.pool.lease_ttl_secs == 0 {
        return Err(invalid("pool.lease-ttl-secs", "must be positive"));
    }
    if config.pool.heartbeat_ttl_secs == 0 {
        return Err(invalid("pool.heartbeat-ttl-secs", "must be positive"));
    }
    if config.pool.prune_interval_secs == 0 {
        return Err(invalid("pool.prune-interval-secs", "must be positive"));
    }
    if config.chain.max_staged_builds == 0 {
        return Err(invalid("chain.max-staged-builds", "must be positive"));
    }
    if config.coordinator.claim_retry_max_ms < config.coordinator.claim_retry_initial_ms {
        return Err(invalid(
            "coordinator.claim-retry-max-ms",
            "must be >= claim-retry-initial-ms",
        ));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_int_arg(node: &KdlNode) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))?;
    u64::try_from(value).map_err(|_| invalid(node.name().value(), "must be non-negative"))
}

fn get_bool_arg(node: &KdlNode) -> ConfigResult<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}
