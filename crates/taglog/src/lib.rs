//! # taglog: Tag-partitioned transaction log coordinator
//!
//! This crate implements the coordinator between a cluster's sequencer
//! ("master") and a set of replicated, tag-sharded transaction log servers.
//! It replicates ordered commit pushes under a pluggable replication policy,
//! composes ordered peek cursors across epochs, coalesces per-tag pops, and
//! drives epoch recovery and recruitment.
//!
//! ## Overview
//!
//! ```text
//! Master
//!   │ recover_and_end_epoch
//!   ▼
//! ┌──────────────────┐  lock / rejoin / failure   ┌──────────────┐
//! │ EpochEndRecovery │ ◄────────────────────────► │  old TLogs   │
//! └────────┬─────────┘                            └──────────────┘
//!          │ frozen LogSystem snapshots
//!          ▼
//! ┌──────────────────┐  initialize / recovery_finished
//! │ NewEpochRecruit  │ ◄────────────────────────► new TLogs
//! └────────┬─────────┘
//!          │ active LogSystem
//!          ▼
//!   push / peek / pop / confirm_epoch_live
//! ```
//!
//! ## Architecture
//!
//! The coordinator is a **pure, deterministic state machine** driven by an
//! imperative shell. Components consume [`LogSystemEvent`]s (RPC replies,
//! timer expiries, failure-detector transitions, rejoin announcements) and
//! emit [`Actions`] (outbound RPCs correlated by [`CallId`], timer requests,
//! rejoin replies, completions). The shell ([`driver::Driver`] in
//! production, the simulation harness in tests) owns the transport and the
//! clock. All mutation of a log system happens on one thread.
//!
//! ## Key Components
//!
//! - [`log_system::LogSystem`]: the facade the master talks to
//! - [`recovery::EpochEndRecovery`]: locks the previous epoch and computes
//!   the recoverable end version
//! - [`new_epoch::NewEpochRecruitment`]: recruits and seeds a fresh epoch
//! - [`policy::ReplicationPolicy`]: injected replica placement evaluator

pub mod config;
pub mod core_state;
pub mod driver;
pub mod events;
pub mod handle;
pub mod locality;
pub mod log_system;
pub mod message;
pub mod monitor;
pub mod new_epoch;
pub mod peek;
pub mod policy;
pub(crate) mod pops;
pub mod push;
pub mod rejoin;
pub mod recovery;

#[cfg(test)]
mod simulation;

pub use config::{DatabaseConfig, Environment, Knobs, RealEnvironment, StoreType};
pub use core_state::{
    DbCoreState, LogSystemConfig, LogSystemType, LogsValue, OldTLogConf, OldTLogCoreData,
};
pub use driver::{
    Driver, DriverCommand, DriverHandle, DriverInput, DriverNotification, TLogTransport,
};
pub use events::{
    Actions, CallId, Completion, ConfirmId, LogSystemEvent, OutboundRpc, PushId, RejoinToken,
    RpcTarget, TimerKind,
};
pub use handle::{FailureFlag, LogServerHandle};
pub use locality::LocalitySet;
pub use log_system::{LogSystem, OldLogData, TLogSet};
pub use message::{
    CommitRequest, ConfirmRunningRequest, InitializeTLogRequest, OptionalInterface, PopRequest,
    TLogFault, TLogInterface, TLogLockResult, TLogRejoinRequest, TLogReply, TLogRequest,
    WorkerInterface,
};
pub use monitor::FailureMonitor;
pub use new_epoch::{NewEpochRecruitment, RecruitOutput};
pub use peek::{CursorSpec, MergedCursorSpec, MultiCursorSpec, PeekPlan, SingleCursorSpec};
pub use policy::{
    validate_all_combinations, PolicyAcross, PolicyConfig, PolicyOne, ReplicationPolicy,
};
pub use push::PushData;
pub use recovery::{EpochEndRecovery, RecoveryOutput};
pub use rejoin::RejoinTracker;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the log system.
///
/// A vanished endpoint is a per-call [`message::TLogFault::BrokenPromise`]
/// rather than a system error: the site observing it decides what it means
/// (fatal for pushes, terminal for a pop loop, routine for rejoins).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// A log server shut down in an expected way; silent on the push path.
    #[error("log server stopped")]
    TLogStopped,

    /// The current epoch can no longer accept pushes; a new recovery is needed.
    #[error("log system failed for the current epoch")]
    MasterTLogFailed,

    /// Recruitment of a new epoch failed; the caller retries recovery.
    #[error("recruitment of a new log epoch failed: {reason}")]
    MasterRecoveryFailed { reason: &'static str },

    /// An invariant was violated.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// The driver was abandoned without an orderly shutdown; re-thrown
    /// unchanged, never treated as a log server failure.
    #[error("cancelled")]
    Cancelled,
}

/// Result type for log system operations.
pub type Result<T> = std::result::Result<T, LogError>;
