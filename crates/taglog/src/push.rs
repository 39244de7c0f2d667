//! Commit fan-out and quorum accounting.
//!
//! A push replicates one commit to every log server of the current epoch and
//! completes when `n - anti_quorum` of them acknowledge. Stragglers keep
//! being tracked in the background; their faults still surface through the
//! system-level error channel. Epoch-liveness confirmation uses the same
//! tally over `confirm_running` probes.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use taglog_types::{Tag, Uid};
use tracing::debug;

use crate::events::{Actions, CallId, Completion, ConfirmId, PushId};
use crate::locality::LocalitySet;
use crate::message::{TLogFault, TLogReply};
use crate::policy::ReplicationPolicy;
use crate::LogError;

// ============================================================================
// Push Data
// ============================================================================

/// Per-location slices of one commit.
///
/// The caller adds each tagged message once; routing resolves the tags to a
/// policy-augmented location set, and every chosen location receives the
/// payload and the tags it is responsible for.
#[derive(Debug, Clone)]
pub struct PushData {
    messages: Vec<BytesMut>,
    tags: Vec<Vec<Tag>>,
}

impl PushData {
    /// Creates empty slices for `num_logs` locations.
    pub fn new(num_logs: usize) -> Self {
        Self {
            messages: vec![BytesMut::new(); num_logs],
            tags: vec![Vec::new(); num_logs],
        }
    }

    /// Routes one tagged message to its push locations.
    pub fn add_message(
        &mut self,
        set: &LocalitySet,
        policy: &dyn ReplicationPolicy,
        tags: &[Tag],
        payload: &[u8],
    ) {
        for location in set.push_locations(policy, tags) {
            self.messages[location].extend_from_slice(payload);
            for &tag in tags {
                if !self.tags[location].contains(&tag) {
                    self.tags[location].push(tag);
                }
            }
            self.tags[location].sort_unstable();
        }
    }

    /// Serialized messages for one location.
    pub fn messages_for(&self, location: usize) -> Bytes {
        Bytes::copy_from_slice(&self.messages[location])
    }

    /// Tags routed to one location.
    pub fn tags_for(&self, location: usize) -> &[Tag] {
        &self.tags[location]
    }

    /// Number of locations.
    pub fn num_logs(&self) -> usize {
        self.messages.len()
    }
}

// ============================================================================
// Quorum Tally
// ============================================================================

/// Counts replies toward a quorum of `needed` out of `total`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuorumTally {
    total: usize,
    needed: usize,
    successes: usize,
    failures: usize,
    done: bool,
}

impl QuorumTally {
    pub fn new(total: usize, needed: usize) -> Self {
        debug_assert!(needed <= total, "quorum larger than the set");
        Self {
            total,
            needed,
            successes: 0,
            failures: 0,
            done: false,
        }
    }

    /// Records a success; returns true when the quorum is first reached.
    pub fn success(&mut self) -> bool {
        self.successes += 1;
        if !self.done && self.successes >= self.needed {
            self.done = true;
            return true;
        }
        false
    }

    /// Records a failure; returns true when the quorum first becomes
    /// unreachable.
    pub fn failure(&mut self) -> bool {
        self.failures += 1;
        if !self.done && self.failures > self.total - self.needed {
            self.done = true;
            return true;
        }
        false
    }

    /// All participants have answered.
    pub fn settled(&self) -> bool {
        self.successes + self.failures >= self.total
    }
}

// ============================================================================
// Push Tracker
// ============================================================================

/// Tracks outstanding pushes by call id.
#[derive(Debug, Default)]
pub(crate) struct PushTracker {
    next_push: u64,
    pending_calls: HashMap<CallId, (PushId, Uid)>,
    pushes: HashMap<PushId, QuorumTally>,
}

impl PushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new push over `total` servers needing `needed` acks.
    pub fn begin(&mut self, total: usize, needed: usize) -> PushId {
        self.next_push += 1;
        let push = PushId(self.next_push);
        self.pushes.insert(push, QuorumTally::new(total, needed));
        push
    }

    /// Associates one commit RPC with its push.
    pub fn register_call(&mut self, push: PushId, call: CallId, server: Uid) {
        self.pending_calls.insert(call, (push, server));
    }

    /// Accounts for a slot that cannot acknowledge because it is empty.
    pub fn note_absent(&mut self, push: PushId, actions: &mut Actions) {
        let Some(tally) = self.pushes.get_mut(&push) else {
            return;
        };
        if tally.failure() {
            actions.fail(LogError::MasterTLogFailed);
        }
        if tally.settled() {
            self.pushes.remove(&push);
        }
    }

    /// Routes a commit reply; returns false if the call is not ours.
    pub fn on_reply(
        &mut self,
        call: CallId,
        result: &Result<TLogReply, TLogFault>,
        actions: &mut Actions,
    ) -> bool {
        let Some((push, server)) = self.pending_calls.remove(&call) else {
            return false;
        };
        let Some(tally) = self.pushes.get_mut(&push) else {
            return true;
        };

        match result {
            Ok(_) => {
                if tally.success() {
                    actions.completions.push(Completion::Push(push));
                }
            }
            Err(TLogFault::BrokenPromise) => {
                // The endpoint is gone: the epoch is over regardless of how
                // far this particular push got.
                tally.failure();
                actions.fail(LogError::MasterTLogFailed);
            }
            Err(TLogFault::Stopped) => {
                if tally.failure() {
                    actions.fail(LogError::TLogStopped);
                }
            }
            Err(TLogFault::Timeout) => {
                debug!(%server, "commit timed out");
                if tally.failure() {
                    actions.fail(LogError::MasterTLogFailed);
                }
            }
        }

        if tally.settled() {
            self.pushes.remove(&push);
        }
        true
    }
}

// ============================================================================
// Confirm Tracker
// ============================================================================

/// Tracks epoch-liveness confirmation rounds.
///
/// Absent slots never answer: a round over a set with more than
/// `anti_quorum` empty slots simply never completes, mirroring the push
/// quorum it stands in for.
#[derive(Debug, Default)]
pub(crate) struct ConfirmTracker {
    next_confirm: u64,
    pending_calls: HashMap<CallId, ConfirmId>,
    confirms: HashMap<ConfirmId, QuorumTally>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a confirmation round over `total` slots needing `needed`
    /// replies.
    pub fn begin(&mut self, total: usize, needed: usize) -> ConfirmId {
        self.next_confirm += 1;
        let confirm = ConfirmId(self.next_confirm);
        self.confirms.insert(confirm, QuorumTally::new(total, needed));
        confirm
    }

    /// Associates one probe with its round.
    pub fn register_call(&mut self, confirm: ConfirmId, call: CallId) {
        self.pending_calls.insert(call, confirm);
    }

    /// Routes a probe reply; returns false if the call is not ours.
    pub fn on_reply(
        &mut self,
        call: CallId,
        result: &Result<TLogReply, TLogFault>,
        actions: &mut Actions,
    ) -> bool {
        let Some(confirm) = self.pending_calls.remove(&call) else {
            return false;
        };
        let Some(tally) = self.confirms.get_mut(&confirm) else {
            return true;
        };

        match result {
            Ok(_) => {
                if tally.success() {
                    actions.completions.push(Completion::ConfirmEpochLive(confirm));
                }
            }
            // A vanished endpoint is treated as eternally silent here, not
            // as an answer.
            Err(TLogFault::BrokenPromise) => {}
            Err(_) => {
                if tally.failure() {
                    actions.fail(LogError::MasterTLogFailed);
                }
            }
        }

        if tally.settled() {
            self.confirms.remove(&confirm);
        }
        true
    }
}
