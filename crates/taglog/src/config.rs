//! Coordinator configuration.
//!
//! All tunables flow through [`Knobs`]; simulation-only behavior is selected
//! by the injected [`Environment`]. There are no global singletons.

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyConfig;

// ============================================================================
// Knobs
// ============================================================================

/// Tunables recognized by the coordinator.
#[derive(Debug, Clone)]
pub struct Knobs {
    /// Bounded wait for commit, confirm, initialize, and recovery-finished
    /// RPCs.
    pub tlog_timeout: Duration,

    /// Shapes the failure client's hysteresis; the failure slope is
    /// `-tlog_timeout / seconds_before_no_failure_delay`.
    pub seconds_before_no_failure_delay: f64,

    /// Version horizon used to derive a known committed version from a
    /// recovered end version.
    pub max_read_transaction_life_versions: u64,

    /// Versions the sequencer hands out per second; the simulation horizon
    /// is `10 * versions_per_second`.
    pub versions_per_second: u64,

    /// Failure-detection slope applied to recruitment RPCs.
    pub master_failure_slope_during_recovery: f64,

    /// Reserved: extra wait before settling for a bare read quorum.
    pub recovery_tlog_smart_quorum_delay: Duration,

    /// Interval between pop coalescer iterations per `(log, tag)`.
    pub pop_batch_interval: Duration,
}

impl Knobs {
    /// Production values.
    pub fn production() -> Self {
        Self {
            tlog_timeout: Duration::from_millis(400),
            seconds_before_no_failure_delay: 100.0,
            max_read_transaction_life_versions: 5_000_000,
            versions_per_second: 1_000_000,
            master_failure_slope_during_recovery: 0.999,
            recovery_tlog_smart_quorum_delay: Duration::from_millis(250),
            pop_batch_interval: Duration::from_secs(1),
        }
    }

    /// Values for fast deterministic simulation runs.
    pub fn simulation() -> Self {
        Self {
            tlog_timeout: Duration::from_millis(50),
            seconds_before_no_failure_delay: 1.0,
            max_read_transaction_life_versions: 5_000_000,
            versions_per_second: 1_000_000,
            master_failure_slope_during_recovery: 0.999,
            recovery_tlog_smart_quorum_delay: Duration::from_millis(10),
            pop_batch_interval: Duration::from_millis(10),
        }
    }

    /// Horizon subtracted from a recovered end version to bound the known
    /// committed version. In simulation this must be the maximum read
    /// transaction lifetime, expressed as `10 * versions_per_second`.
    pub fn known_committed_horizon(&self, env: &dyn Environment) -> u64 {
        if env.is_simulated() {
            10 * self.versions_per_second
        } else {
            self.max_read_transaction_life_versions
        }
    }
}

impl Default for Knobs {
    fn default() -> Self {
        Self::production()
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Host environment the coordinator runs in.
///
/// Injected so that simulation-only behavior never leaks into production
/// code paths.
pub trait Environment: Debug + Send + Sync {
    /// Returns true under deterministic simulation.
    fn is_simulated(&self) -> bool;

    /// Returns true when the simulation is in its sped-up phase.
    fn speed_up_simulation(&self) -> bool {
        false
    }

    /// Returns true when fault injection should fire.
    fn buggify(&self) -> bool {
        false
    }
}

/// The production environment: never simulated, never injects faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealEnvironment;

impl Environment for RealEnvironment {
    fn is_simulated(&self) -> bool {
        false
    }
}

// ============================================================================
// Database Configuration
// ============================================================================

/// Storage engine for recruited log servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StoreType {
    /// In-memory store with a write-ahead log.
    #[default]
    Memory,

    /// SSD-backed btree store.
    SsdBtree,
}

/// The slice of cluster configuration a new epoch is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Copies of each message: `1 <= replication_factor <= n`.
    pub tlog_replication_factor: usize,

    /// Acks a push may skip: `0 <= write_anti_quorum < n`.
    pub tlog_write_anti_quorum: usize,

    /// Replica placement policy for the new epoch.
    pub tlog_policy: PolicyConfig,

    /// Storage engine for recruited servers.
    pub tlog_store_type: StoreType,
}

impl DatabaseConfig {
    /// Single-copy configuration, useful for tests and bootstrap.
    pub fn single() -> Self {
        Self {
            tlog_replication_factor: 1,
            tlog_write_anti_quorum: 0,
            tlog_policy: PolicyConfig::One,
            tlog_store_type: StoreType::Memory,
        }
    }
}
