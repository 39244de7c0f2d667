//! Persisted and advertised log system state.
//!
//! [`DbCoreState`] is the log-system portion of the coordinated state store:
//! servers by uid only, plus replication parameters and the frozen history.
//! [`LogSystemConfig`] is the richer advertised form carrying live
//! interfaces where known, from which consumers reconstruct a read-only
//! [`crate::LogSystem`].

use serde::{Deserialize, Serialize};
use taglog_types::{LocalityData, NetworkAddress, Uid, Version};

use crate::message::OptionalInterface;
use crate::policy::PolicyConfig;
use crate::LogError;

// ============================================================================
// Log System Type
// ============================================================================

/// Wire-tagged kind of a persisted log system.
///
/// Only two values are valid; anything else on the wire is rejected as an
/// internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum LogSystemType {
    /// No log system (brand new or legacy state).
    #[default]
    Empty,

    /// Tag-partitioned log system.
    TagPartitioned,
}

impl From<LogSystemType> for u8 {
    fn from(t: LogSystemType) -> Self {
        match t {
            LogSystemType::Empty => 0,
            LogSystemType::TagPartitioned => 2,
        }
    }
}

impl TryFrom<u8> for LogSystemType {
    type Error = LogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LogSystemType::Empty),
            2 => Ok(LogSystemType::TagPartitioned),
            _ => Err(LogError::Internal("unknown log system type")),
        }
    }
}

// ============================================================================
// Core State
// ============================================================================

/// One frozen epoch in the persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldTLogCoreData {
    /// Server identities, in slot order.
    pub tlogs: Vec<Uid>,

    /// Replication factor of the epoch.
    pub tlog_replication_factor: usize,

    /// Write anti-quorum of the epoch.
    pub tlog_write_anti_quorum: usize,

    /// Replica placement policy of the epoch.
    pub tlog_policy: PolicyConfig,

    /// Server localities, in slot order.
    pub tlog_localities: Vec<LocalityData>,

    /// First version not served by the epoch.
    pub epoch_end: Version,
}

/// The log-system portion of the coordinated state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCoreState {
    /// Kind of log system this state describes.
    pub log_system_type: LogSystemType,

    /// Current-epoch server identities, in slot order.
    pub tlogs: Vec<Uid>,

    /// Current-epoch server localities, in slot order.
    pub tlog_localities: Vec<LocalityData>,

    /// Current-epoch replication factor.
    pub tlog_replication_factor: usize,

    /// Current-epoch write anti-quorum.
    pub tlog_write_anti_quorum: usize,

    /// Current-epoch replica placement policy.
    pub tlog_policy: PolicyConfig,

    /// Frozen epochs, most recent first; drained once recovery completes.
    pub old_tlog_data: Vec<OldTLogCoreData>,
}

// ============================================================================
// Advertised Configuration
// ============================================================================

/// One frozen epoch in the advertised configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldTLogConf {
    /// Servers with live interfaces where known, in slot order.
    pub tlogs: Vec<OptionalInterface>,

    /// Replication factor of the epoch.
    pub tlog_replication_factor: usize,

    /// Write anti-quorum of the epoch.
    pub tlog_write_anti_quorum: usize,

    /// Replica placement policy of the epoch.
    pub tlog_policy: PolicyConfig,

    /// Server localities, in slot order.
    pub tlog_localities: Vec<LocalityData>,

    /// First version not served by the epoch.
    pub epoch_end: Version,
}

/// The advertised log system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSystemConfig {
    /// Kind of log system this configuration describes.
    pub log_system_type: LogSystemType,

    /// Current-epoch servers, in slot order.
    pub tlogs: Vec<OptionalInterface>,

    /// Current-epoch replication factor.
    pub tlog_replication_factor: usize,

    /// Current-epoch write anti-quorum.
    pub tlog_write_anti_quorum: usize,

    /// Current-epoch replica placement policy.
    pub tlog_policy: PolicyConfig,

    /// Current-epoch server localities, in slot order.
    pub tlog_localities: Vec<LocalityData>,

    /// Frozen epochs, most recent first; absent once the post-recovery core
    /// state is written.
    pub old_tlogs: Vec<OldTLogConf>,
}

impl LogSystemConfig {
    /// Validates the type/content combination of a received configuration.
    ///
    /// A tag-partitioned configuration may carry anything; an empty one must
    /// actually be empty.
    pub fn check(&self) -> crate::Result<()> {
        match self.log_system_type {
            LogSystemType::TagPartitioned => Ok(()),
            LogSystemType::Empty if self.tlogs.is_empty() => Ok(()),
            LogSystemType::Empty => Err(LogError::Internal(
                "empty log system config with current servers",
            )),
        }
    }
}

// ============================================================================
// Discovery export
// ============================================================================

/// Compact `(uid, address)` listing for external discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsValue {
    /// Current-epoch servers.
    pub logs: Vec<(Uid, NetworkAddress)>,

    /// Old-epoch servers, while recovery has not been persisted.
    pub old_logs: Vec<(Uid, NetworkAddress)>,
}
