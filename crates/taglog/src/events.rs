//! Events consumed and actions produced by the coordinator state machines.
//!
//! The coordinator is pure: the shell delivers [`LogSystemEvent`]s and
//! executes the [`Actions`] each step returns. RPCs are correlated by
//! [`CallId`]; timers by [`TimerKind`].

use std::fmt::Display;
use std::time::Duration;

use taglog_types::{Tag, Uid};

use crate::message::{TLogFault, TLogRejoinRequest, TLogReply, TLogRequest};
use crate::LogError;

// ============================================================================
// Correlation Ids
// ============================================================================

/// Correlates an outbound RPC with its eventual reply or fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(u64);

impl Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Allocator for [`CallId`]s; one per state machine owner.
#[derive(Debug, Default)]
pub(crate) struct CallIdGen(u64);

impl CallIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> CallId {
        self.0 += 1;
        CallId(self.0)
    }
}

/// Identifies one push fan-out from [`crate::LogSystem::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushId(pub(crate) u64);

/// Identifies one epoch-liveness confirmation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfirmId(pub(crate) u64);

/// Token the shell maps back to a pending rejoin reply promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RejoinToken(pub u64);

// ============================================================================
// Timers
// ============================================================================

/// Timers a state machine can request; echoed back verbatim on expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Next iteration of the pop coalescer loop for one `(log, tag)` key.
    PopWake { log: usize, tag: Tag },

    /// Bounded-wait deadline for an outstanding RPC.
    CallDeadline(CallId),
}

// ============================================================================
// Events
// ============================================================================

/// Inputs to the coordinator state machines.
#[derive(Debug, Clone)]
pub enum LogSystemEvent {
    /// A reply (or terminal fault) for an outstanding RPC.
    Reply {
        call: CallId,
        reply: std::result::Result<TLogReply, TLogFault>,
    },

    /// A requested timer fired.
    Timeout(TimerKind),

    /// The failure detector for a log server changed state.
    Failure { server: Uid, failed: bool },

    /// A log server announced itself to the coordinator.
    Rejoin(TLogRejoinRequest),
}

// ============================================================================
// Actions
// ============================================================================

/// Where an outbound RPC is addressed.
#[derive(Debug, Clone)]
pub enum RpcTarget {
    /// A log server interface of the current or an old epoch.
    Log(crate::message::TLogInterface),

    /// A candidate worker being recruited.
    Worker(crate::message::WorkerInterface),
}

impl RpcTarget {
    /// Uid of the destination process.
    pub fn id(&self) -> Uid {
        match self {
            RpcTarget::Log(interface) => interface.id,
            RpcTarget::Worker(worker) => worker.id,
        }
    }
}

/// An RPC for the shell to send.
#[derive(Debug, Clone)]
pub struct OutboundRpc {
    /// Correlation id the reply must carry.
    pub call: CallId,

    /// Destination endpoint.
    pub target: RpcTarget,

    /// The request payload.
    pub request: TLogRequest,

    /// Bounded wait; expiry is delivered as [`TimerKind::CallDeadline`].
    pub deadline: Option<Duration>,
}

/// Notifications to the caller that a multi-RPC operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A push reached its write quorum.
    Push(PushId),

    /// An epoch-liveness confirmation reached its quorum.
    ConfirmEpochLive(ConfirmId),

    /// All recruited log servers reported recovery finished.
    RecoveryComplete,
}

/// Output of one state machine step.
#[derive(Debug, Default)]
pub struct Actions {
    /// RPCs to send.
    pub rpcs: Vec<OutboundRpc>,

    /// Timers to arm.
    pub timers: Vec<(TimerKind, Duration)>,

    /// Decisions for pending rejoin promises (`true` means "stop").
    pub rejoin_replies: Vec<(RejoinToken, bool)>,

    /// Finished multi-RPC operations.
    pub completions: Vec<Completion>,

    /// A failure of the whole system; the `on_error` contract.
    pub fatal: Option<LogError>,
}

impl Actions {
    /// Creates an empty action set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if nothing needs to be executed.
    pub fn is_empty(&self) -> bool {
        self.rpcs.is_empty()
            && self.timers.is_empty()
            && self.rejoin_replies.is_empty()
            && self.completions.is_empty()
            && self.fatal.is_none()
    }

    /// Merges another action set into this one.
    ///
    /// The first fatal error wins; later ones are redundant by then.
    pub fn merge(&mut self, other: Actions) {
        self.rpcs.extend(other.rpcs);
        self.timers.extend(other.timers);
        self.rejoin_replies.extend(other.rejoin_replies);
        self.completions.extend(other.completions);
        if self.fatal.is_none() {
            self.fatal = other.fatal;
        }
    }

    /// Records a fatal error unless one is already set.
    pub(crate) fn fail(&mut self, error: LogError) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }
}
