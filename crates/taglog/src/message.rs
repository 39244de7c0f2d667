//! RPC requests and replies exchanged with log servers.
//!
//! The coordinator consumes these endpoints on every log server, keyed by
//! [`Uid`]:
//!
//! - [`CommitRequest`] - replicate one commit's slice for this server
//! - [`PopRequest`] - reclaim space up to a version for one tag
//! - `Lock` - freeze the server and report its recoverable state
//! - `ConfirmRunning` - liveness probe for epoch confirmation
//! - `RecoveryFinished` - recruited server completed catch-up
//! - [`InitializeTLogRequest`] - recruit a worker as a log server
//!
//! Rejoin announcements ([`TLogRejoinRequest`]) arrive as a stream rather
//! than as replies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use taglog_types::{LocalityData, LogEpoch, NetworkAddress, Tag, Uid, Version};

use crate::config::StoreType;
use crate::core_state::LogSystemConfig;
use crate::events::RejoinToken;

// ============================================================================
// Interfaces
// ============================================================================

/// Addressable endpoint of one log server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogInterface {
    /// Stable identity; survives restarts and rejoins.
    pub id: Uid,

    /// Where the server currently answers.
    pub address: NetworkAddress,

    /// Placement metadata used by replication policies.
    pub locality: LocalityData,
}

/// A candidate worker offered by the cluster controller for recruitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInterface {
    /// Stable identity of the worker process.
    pub id: Uid,

    /// Where the worker answers recruitment requests.
    pub address: NetworkAddress,

    /// Placement metadata used by replication policies.
    pub locality: LocalityData,
}

/// A log server known by identity, possibly without a live interface yet.
///
/// Persisted state names servers by uid; the interface is filled in when the
/// server rejoins. Handle slots hold this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalInterface {
    id: Uid,
    interface: Option<TLogInterface>,
}

impl OptionalInterface {
    /// A server known only by uid.
    pub fn id_only(id: Uid) -> Self {
        Self {
            id,
            interface: None,
        }
    }

    /// A server with a live interface.
    pub fn known(interface: TLogInterface) -> Self {
        Self {
            id: interface.id,
            interface: Some(interface),
        }
    }

    /// The server's stable identity.
    pub fn id(&self) -> Uid {
        self.id
    }

    /// Returns true if a live interface is known.
    pub fn present(&self) -> bool {
        self.interface.is_some()
    }

    /// The live interface, if known.
    pub fn interf(&self) -> Option<&TLogInterface> {
        self.interface.as_ref()
    }

    /// The server's address, empty while the interface is unknown.
    pub fn address(&self) -> NetworkAddress {
        self.interface
            .as_ref()
            .map(|i| i.address)
            .unwrap_or_default()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Replicates one commit's slice to a log server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Version of the previous commit this server observed.
    pub prev_version: Version,

    /// Version being committed.
    pub version: Version,

    /// Conservative lower bound on fully replicated versions.
    pub known_committed_version: Version,

    /// Serialized messages routed to this server.
    pub messages: Bytes,

    /// Tags present in `messages`.
    pub tags: Vec<Tag>,

    /// Correlation id for commit tracing.
    pub debug_id: Option<Uid>,
}

/// Advances the popped (reclaimable) version for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopRequest {
    /// All messages for `tag` at or below this version may be discarded.
    pub up_to: Version,

    /// The tag being popped.
    pub tag: Tag,
}

/// Liveness probe; a reply confirms the server still accepts this epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRunningRequest {
    /// Correlation id for tracing.
    pub debug_id: Option<Uid>,
}

/// Recruits a worker as a log server of a new epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeTLogRequest {
    /// Identifies one recruitment round; servers dedupe on it.
    pub recruitment_id: Uid,

    /// Storage engine the new server should use.
    pub store_type: StoreType,

    /// The frozen log system to recover data from.
    pub recover_from: LogSystemConfig,

    /// First version of the new epoch.
    pub recover_at: Version,

    /// Conservative lower bound carried over from recovery.
    pub known_committed_version: Version,

    /// The new server's epoch.
    pub epoch: LogEpoch,

    /// Tags this server must fetch from the old epoch.
    pub recover_tags: Vec<Tag>,
}

/// A log server (re)announcing itself to the coordinator.
///
/// The reply decision is `true` when the server is not part of any known
/// epoch and should stop.
#[derive(Debug, Clone)]
pub struct TLogRejoinRequest {
    /// The announcing server's live interface.
    pub interface: TLogInterface,

    /// Reply promise token; resolved by the rejoin tracker.
    pub reply: RejoinToken,
}

// ============================================================================
// Replies
// ============================================================================

/// Result of locking one log server during recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogLockResult {
    /// First version this server does not have.
    pub end: Version,

    /// This server's known committed version.
    pub known_committed_version: Version,

    /// Tags this server has seen data for.
    pub tags: Vec<Tag>,
}

/// Request payloads, dispatched by the shell to the target's endpoint.
#[derive(Debug, Clone)]
pub enum TLogRequest {
    /// Replicate a commit slice.
    Commit(CommitRequest),

    /// Advance the popped version for a tag.
    Pop(PopRequest),

    /// Freeze the server and report recoverable state.
    Lock,

    /// Liveness probe.
    ConfirmRunning(ConfirmRunningRequest),

    /// Ask a recruited server whether catch-up finished.
    RecoveryFinished,

    /// Recruit a worker.
    InitializeTLog(Box<InitializeTLogRequest>),
}

impl TLogRequest {
    /// Human-readable request name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            TLogRequest::Commit(_) => "Commit",
            TLogRequest::Pop(_) => "Pop",
            TLogRequest::Lock => "Lock",
            TLogRequest::ConfirmRunning(_) => "ConfirmRunning",
            TLogRequest::RecoveryFinished => "RecoveryFinished",
            TLogRequest::InitializeTLog(_) => "InitializeTLog",
        }
    }
}

/// Successful reply payloads.
#[derive(Debug, Clone)]
pub enum TLogReply {
    /// Commit accepted and durable on this server.
    Committed,

    /// Pop acknowledged.
    Popped,

    /// Lock result.
    Locked(TLogLockResult),

    /// Server is running and accepts this epoch.
    Running,

    /// Catch-up finished.
    RecoveryFinished,

    /// A recruited worker came up as this log server.
    TLogStarted(TLogInterface),
}

/// Terminal per-call faults reported by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TLogFault {
    /// The server shut down in an expected way.
    Stopped,

    /// The endpoint is gone; no reply will ever arrive.
    BrokenPromise,

    /// The bounded wait for this call expired.
    Timeout,
}

impl std::fmt::Display for TLogFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TLogFault::Stopped => write!(f, "stopped"),
            TLogFault::BrokenPromise => write!(f, "broken promise"),
            TLogFault::Timeout => write!(f, "timeout"),
        }
    }
}
