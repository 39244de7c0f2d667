//! The log system facade.
//!
//! [`LogSystem`] binds replica selection, push fan-out, peek composition,
//! pop coalescing, and recovery bookkeeping into the contract the master
//! consumes. A log system is created in one of three ways: reconstructed
//! read-only from an advertised configuration ([`LogSystem::from_config`]),
//! published frozen by epoch-end recovery, or recruited fresh by the new
//! epoch builder. A frozen system becomes active only after the master
//! persists the corresponding core state and recruits its successor.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use taglog_types::{LocalityData, Tag, Uid, Version};
use tracing::debug;

use crate::config::Knobs;
use crate::core_state::{
    DbCoreState, LogSystemConfig, LogSystemType, LogsValue, OldTLogConf, OldTLogCoreData,
};
use crate::events::{
    Actions, CallId, CallIdGen, Completion, ConfirmId, LogSystemEvent, OutboundRpc, PushId,
    RpcTarget, TimerKind,
};
use crate::handle::LogServerHandle;
use crate::message::{
    CommitRequest, ConfirmRunningRequest, OptionalInterface, TLogFault, TLogReply, TLogRequest,
};
use crate::peek::{compose_peek, compose_peek_single, PeekPlan};
use crate::policy::ReplicationPolicy;
use crate::pops::PopTracker;
use crate::push::{ConfirmTracker, PushData, PushTracker};
use crate::{LogError, Result};

// ============================================================================
// TLog Set
// ============================================================================

/// One epoch's ordered server handles with its replication parameters.
#[derive(Debug, Clone)]
pub struct TLogSet {
    /// Handle slots, in recruitment order; never recycled across epochs.
    pub handles: Vec<LogServerHandle>,

    /// Per-slot localities.
    pub localities: Vec<LocalityData>,

    /// Copies of each message.
    pub replication_factor: usize,

    /// Acknowledgements a push may skip.
    pub write_anti_quorum: usize,

    /// Replica placement policy.
    pub policy: Arc<dyn ReplicationPolicy>,
}

impl TLogSet {
    /// Number of slots.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if the epoch has no servers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Snapshot of every slot's contents.
    pub fn slots(&self) -> Vec<OptionalInterface> {
        self.handles.iter().map(LogServerHandle::get).collect()
    }

    /// Locality set over the live slots.
    pub fn locality_set(&self) -> crate::locality::LocalitySet {
        crate::locality::LocalitySet::from_interfaces(&self.slots())
    }

    fn from_conf(
        tlogs: &[OptionalInterface],
        localities: &[LocalityData],
        replication_factor: usize,
        write_anti_quorum: usize,
        policy: Arc<dyn ReplicationPolicy>,
    ) -> Self {
        Self {
            handles: tlogs
                .iter()
                .map(|slot| LogServerHandle::new(slot.clone()))
                .collect(),
            localities: localities.to_vec(),
            replication_factor,
            write_anti_quorum,
            policy,
        }
    }
}

/// A frozen epoch and where it ends.
#[derive(Debug, Clone)]
pub struct OldLogData {
    /// The epoch's server set.
    pub set: TLogSet,

    /// First version not served by this epoch.
    pub epoch_end: Version,
}

// ============================================================================
// Recovery status
// ============================================================================

/// Progress of the recruited servers' catch-up.
#[derive(Debug)]
pub(crate) enum RecoveryStatus {
    /// This system was not produced by recruitment.
    NotRecruited,

    /// Waiting on `recovery_finished` replies for these calls.
    Pending(HashSet<CallId>),

    /// Every recruited server finished catching up.
    Done,

    /// A recruited server failed before finishing.
    Failed,
}

// ============================================================================
// Log System
// ============================================================================

/// The tag-partitioned log system facade.
#[derive(Debug)]
pub struct LogSystem {
    pub(crate) dbgid: Uid,
    pub(crate) locality: LocalityData,
    pub(crate) log_system_type: LogSystemType,
    pub(crate) current: TLogSet,
    pub(crate) old_log_data: Vec<OldLogData>,
    pub(crate) epoch_end_version: Option<Version>,
    pub(crate) known_committed_version: Version,
    pub(crate) epoch_end_tags: BTreeSet<Tag>,
    pub(crate) recovery_complete_written: bool,
    pub(crate) recovery: RecoveryStatus,
    pub(crate) pops: PopTracker,
    pub(crate) pushes: PushTracker,
    pub(crate) confirms: ConfirmTracker,
    pub(crate) calls: CallIdGen,
    pub(crate) knobs: Knobs,
}

impl LogSystem {
    pub(crate) fn bare(
        dbgid: Uid,
        locality: LocalityData,
        current: TLogSet,
        knobs: Knobs,
    ) -> Self {
        let pop_interval = knobs.pop_batch_interval;
        Self {
            dbgid,
            locality,
            log_system_type: LogSystemType::TagPartitioned,
            current,
            old_log_data: Vec::new(),
            epoch_end_version: None,
            known_committed_version: Version::ZERO,
            epoch_end_tags: BTreeSet::new(),
            recovery_complete_written: false,
            recovery: RecoveryStatus::NotRecruited,
            pops: PopTracker::new(pop_interval),
            pushes: PushTracker::new(),
            confirms: ConfirmTracker::new(),
            calls: CallIdGen::new(),
            knobs,
        }
    }

    // ========================================================================
    // Construction from advertised configuration
    // ========================================================================

    /// Read-only reconstruction from an advertised configuration.
    ///
    /// Returns `Ok(None)` for an empty configuration.
    pub fn from_config(
        dbgid: Uid,
        locality: LocalityData,
        conf: &LogSystemConfig,
        knobs: Knobs,
    ) -> Result<Option<Self>> {
        conf.check()?;
        if conf.log_system_type == LogSystemType::Empty {
            return Ok(None);
        }

        let current = TLogSet::from_conf(
            &conf.tlogs,
            &conf.tlog_localities,
            conf.tlog_replication_factor,
            conf.tlog_write_anti_quorum,
            conf.tlog_policy.build(),
        );
        let mut system = Self::bare(dbgid, locality, current, knobs);
        system.log_system_type = conf.log_system_type;
        system.old_log_data = conf
            .old_tlogs
            .iter()
            .map(|old| OldLogData {
                set: TLogSet::from_conf(
                    &old.tlogs,
                    &old.tlog_localities,
                    old.tlog_replication_factor,
                    old.tlog_write_anti_quorum,
                    old.tlog_policy.build(),
                ),
                epoch_end: old.epoch_end,
            })
            .collect();
        Ok(Some(system))
    }

    /// Reconstruction viewing the *previous* epoch as current.
    ///
    /// Used by recruited servers to read the epoch they recover from.
    pub fn from_old_config(
        dbgid: Uid,
        locality: LocalityData,
        conf: &LogSystemConfig,
        knobs: Knobs,
    ) -> Result<Option<Self>> {
        conf.check()?;
        if conf.log_system_type == LogSystemType::Empty {
            return Ok(None);
        }

        let Some(newest) = conf.old_tlogs.first() else {
            let empty = TLogSet {
                handles: Vec::new(),
                localities: Vec::new(),
                replication_factor: 1,
                write_anti_quorum: 0,
                policy: conf.tlog_policy.build(),
            };
            let mut system = Self::bare(dbgid, locality, empty, knobs);
            system.log_system_type = conf.log_system_type;
            return Ok(Some(system));
        };

        let current = TLogSet::from_conf(
            &newest.tlogs,
            &newest.tlog_localities,
            newest.tlog_replication_factor,
            newest.tlog_write_anti_quorum,
            newest.tlog_policy.build(),
        );
        let mut system = Self::bare(dbgid, locality, current, knobs);
        system.log_system_type = conf.log_system_type;
        system.old_log_data = conf
            .old_tlogs
            .iter()
            .skip(1)
            .map(|old| OldLogData {
                set: TLogSet::from_conf(
                    &old.tlogs,
                    &old.tlog_localities,
                    old.tlog_replication_factor,
                    old.tlog_write_anti_quorum,
                    old.tlog_policy.build(),
                ),
                epoch_end: old.epoch_end,
            })
            .collect();
        Ok(Some(system))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Debug identity of this log system.
    pub fn dbgid(&self) -> Uid {
        self.dbgid
    }

    /// Comma-joined current server identities, for logging.
    pub fn describe(&self) -> String {
        self.current
            .handles
            .iter()
            .map(|handle| handle.id().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Number of current-epoch servers.
    pub fn log_server_count(&self) -> usize {
        self.current.len()
    }

    /// The current server set.
    pub fn current(&self) -> &TLogSet {
        &self.current
    }

    /// Frozen epochs, most recent first.
    pub fn old_log_data(&self) -> &[OldLogData] {
        &self.old_log_data
    }

    /// End version of a frozen system.
    pub fn epoch_end_version(&self) -> Option<Version> {
        self.epoch_end_version
    }

    /// Conservative lower bound on fully replicated versions.
    pub fn known_committed_version(&self) -> Version {
        self.known_committed_version
    }

    /// Union of tags seen by the locked servers at epoch end.
    pub fn epoch_end_tags(&self) -> &BTreeSet<Tag> {
        &self.epoch_end_tags
    }

    /// First version past the frozen epoch.
    ///
    /// # Panics
    ///
    /// Panics if the epoch is still serving; callers only ask after recovery
    /// froze it.
    pub fn get_end(&self) -> Version {
        self.epoch_end_version
            .expect("end of an epoch that is still serving")
            .next()
    }

    /// Upper bound for peek plans: [`Self::get_end`] when frozen, else
    /// unbounded.
    pub fn peek_end(&self) -> Version {
        match self.epoch_end_version {
            Some(_) => self.get_end(),
            None => Version::MAX,
        }
    }

    /// True once a core state without old epochs has been persisted.
    pub fn is_recovery_complete_written(&self) -> bool {
        self.recovery_complete_written
    }

    /// True once every recruited server reported recovery finished.
    pub fn is_recovery_finished(&self) -> bool {
        matches!(self.recovery, RecoveryStatus::Done)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Replicates one commit to every current server.
    ///
    /// The returned push completes, via [`Completion::Push`], once
    /// `n - write_anti_quorum` servers acknowledge; stragglers continue in
    /// the background and their faults surface through `Actions::fatal`.
    pub fn push(
        &mut self,
        prev_version: Version,
        version: Version,
        known_committed: Version,
        data: &PushData,
        debug_id: Option<Uid>,
    ) -> (PushId, Actions) {
        let mut actions = Actions::empty();
        let n = self.current.len();
        let needed = taglog_types::write_quorum(n, self.current.write_anti_quorum);
        let push = self.pushes.begin(n, needed);

        for (location, handle) in self.current.handles.iter().enumerate() {
            let slot = handle.get();
            let Some(interface) = slot.interf() else {
                self.pushes.note_absent(push, &mut actions);
                continue;
            };
            let call = self.calls.next();
            self.pushes.register_call(push, call, interface.id);
            actions.rpcs.push(OutboundRpc {
                call,
                target: RpcTarget::Log(interface.clone()),
                request: TLogRequest::Commit(CommitRequest {
                    prev_version,
                    version,
                    known_committed_version: known_committed,
                    messages: data.messages_for(location),
                    tags: data.tags_for(location).to_vec(),
                    debug_id,
                }),
                deadline: Some(self.knobs.tlog_timeout),
            });
        }
        (push, actions)
    }

    /// Plans a quorum-merged peek of `tag` from `begin`.
    pub fn peek(&self, begin: Version, tag: Tag, parallel_get_more: bool) -> PeekPlan {
        compose_peek(
            &self.current,
            &self.old_log_data,
            self.peek_end(),
            begin,
            tag,
            parallel_get_more,
        )
    }

    /// Plans a single-server peek of `tag` from `begin`.
    pub fn peek_single(&self, begin: Version, tag: Tag) -> PeekPlan {
        compose_peek_single(&self.current, &self.old_log_data, self.peek_end(), begin, tag)
    }

    /// Raises the pop target for `tag` on every current server.
    pub fn pop(&mut self, up_to: Version, tag: Tag) -> Actions {
        let mut actions = Actions::empty();
        self.pops.pop(up_to, tag, self.current.len(), &mut actions);
        actions
    }

    /// Confirms that pushes in the current epoch are still possible.
    ///
    /// Completes, via [`Completion::ConfirmEpochLive`], once
    /// `n - write_anti_quorum` servers answer the probe. Absent slots never
    /// answer.
    pub fn confirm_epoch_live(&mut self, debug_id: Option<Uid>) -> (ConfirmId, Actions) {
        let mut actions = Actions::empty();
        let n = self.current.len();
        let needed = taglog_types::write_quorum(n, self.current.write_anti_quorum);
        let confirm = self.confirms.begin(n, needed);

        for handle in &self.current.handles {
            let slot = handle.get();
            let Some(interface) = slot.interf() else {
                continue;
            };
            let call = self.calls.next();
            self.confirms.register_call(confirm, call);
            actions.rpcs.push(OutboundRpc {
                call,
                target: RpcTarget::Log(interface.clone()),
                request: TLogRequest::ConfirmRunning(ConfirmRunningRequest { debug_id }),
                deadline: Some(self.knobs.tlog_timeout),
            });
        }
        (confirm, actions)
    }

    // ========================================================================
    // Event Processing
    // ========================================================================

    /// Processes one event.
    ///
    /// The `on_error` contract lives here: a failure-detector transition for
    /// any present current server, or a broken promise on the push path,
    /// sets `Actions::fatal` to [`LogError::MasterTLogFailed`].
    pub fn handle(&mut self, event: LogSystemEvent) -> Actions {
        let mut actions = Actions::empty();
        match event {
            LogSystemEvent::Reply { call, reply } => {
                self.route_reply(call, &reply, &mut actions);
            }
            LogSystemEvent::Timeout(TimerKind::PopWake { log, tag }) => {
                self.pops
                    .on_wake(log, tag, &self.current.handles, &mut self.calls, &mut actions);
            }
            LogSystemEvent::Timeout(TimerKind::CallDeadline(call)) => {
                self.route_reply(call, &Err(TLogFault::Timeout), &mut actions);
            }
            LogSystemEvent::Failure { server, failed } => {
                if failed && self.is_present_current(server) {
                    actions.fail(LogError::MasterTLogFailed);
                }
            }
            // Rejoins are a recovery concern; an active system leaves the
            // announcement pending for the next recovery to answer.
            LogSystemEvent::Rejoin(request) => {
                debug!(dbgid = %self.dbgid, server = %request.interface.id, "rejoin ignored outside recovery");
            }
        }
        actions
    }

    fn is_present_current(&self, server: Uid) -> bool {
        self.current.handles.iter().any(|handle| {
            let slot = handle.get();
            slot.present() && slot.id() == server
        })
    }

    fn route_reply(
        &mut self,
        call: CallId,
        reply: &std::result::Result<TLogReply, TLogFault>,
        actions: &mut Actions,
    ) {
        if self.pushes.on_reply(call, reply, actions) {
            return;
        }
        if self.confirms.on_reply(call, reply, actions) {
            return;
        }
        if self.pops.on_reply(call, reply, actions) {
            return;
        }
        let mut finished = false;
        let mut failed = false;
        if let RecoveryStatus::Pending(outstanding) = &mut self.recovery {
            if outstanding.remove(&call) {
                match reply {
                    Ok(_) => finished = outstanding.is_empty(),
                    Err(fault) => {
                        debug!(dbgid = %self.dbgid, %fault, "recovery finished call failed");
                        failed = true;
                    }
                }
            }
        }
        if finished {
            self.recovery = RecoveryStatus::Done;
            actions.completions.push(Completion::RecoveryComplete);
        } else if failed {
            self.recovery = RecoveryStatus::Failed;
        }
        // Anything else is a stale call from a settled operation.
    }

    // ========================================================================
    // Core State
    // ========================================================================

    /// Serializes this system into the coordinated state store form.
    ///
    /// Old epochs are included until every recruited server finished
    /// recovery. Fails if recruitment already failed.
    pub fn to_core_state(&self) -> Result<DbCoreState> {
        if matches!(self.recovery, RecoveryStatus::Failed) {
            return Err(LogError::MasterRecoveryFailed {
                reason: "a recruited log server failed before finishing recovery",
            });
        }

        let old_tlog_data = if matches!(self.recovery, RecoveryStatus::Done) {
            Vec::new()
        } else {
            self.old_log_data
                .iter()
                .map(|old| OldTLogCoreData {
                    tlogs: old.set.handles.iter().map(LogServerHandle::id).collect(),
                    tlog_replication_factor: old.set.replication_factor,
                    tlog_write_anti_quorum: old.set.write_anti_quorum,
                    tlog_policy: old.set.policy.config(),
                    tlog_localities: old.set.localities.clone(),
                    epoch_end: old.epoch_end,
                })
                .collect()
        };

        Ok(DbCoreState {
            log_system_type: self.log_system_type,
            tlogs: self.current.handles.iter().map(LogServerHandle::id).collect(),
            tlog_localities: self.effective_localities(),
            tlog_replication_factor: self.current.replication_factor,
            tlog_write_anti_quorum: self.current.write_anti_quorum,
            tlog_policy: self.current.policy.config(),
            old_tlog_data,
        })
    }

    /// Per-slot localities, preferring what live interfaces report.
    fn effective_localities(&self) -> Vec<LocalityData> {
        self.current
            .handles
            .iter()
            .enumerate()
            .map(|(i, handle)| match handle.get().interf() {
                Some(interface) => interface.locality.clone(),
                None => self.current.localities.get(i).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Notes that the master persisted `new_state`.
    pub fn core_state_written(&mut self, new_state: &DbCoreState) {
        if new_state.old_tlog_data.is_empty() {
            self.recovery_complete_written = true;
        }
    }

    /// The advertised configuration.
    ///
    /// Old epochs are omitted once the post-recovery core state was written.
    pub fn get_log_system_config(&self) -> LogSystemConfig {
        let old_tlogs = if self.recovery_complete_written {
            Vec::new()
        } else {
            self.old_log_data
                .iter()
                .map(|old| OldTLogConf {
                    tlogs: old.set.slots(),
                    tlog_replication_factor: old.set.replication_factor,
                    tlog_write_anti_quorum: old.set.write_anti_quorum,
                    tlog_policy: old.set.policy.config(),
                    tlog_localities: old.set.localities.clone(),
                    epoch_end: old.epoch_end,
                })
                .collect()
        };

        LogSystemConfig {
            log_system_type: self.log_system_type,
            tlogs: self.current.slots(),
            tlog_replication_factor: self.current.replication_factor,
            tlog_write_anti_quorum: self.current.write_anti_quorum,
            tlog_policy: self.current.policy.config(),
            tlog_localities: self.current.localities.clone(),
            old_tlogs,
        }
    }

    /// Compact `(uid, address)` export for external discovery.
    pub fn get_logs_value(&self) -> LogsValue {
        let logs = self
            .current
            .handles
            .iter()
            .map(|handle| {
                let slot = handle.get();
                (slot.id(), slot.address())
            })
            .collect();

        let old_logs = if self.recovery_complete_written {
            Vec::new()
        } else {
            self.old_log_data
                .iter()
                .flat_map(|old| old.set.handles.iter())
                .map(|handle| {
                    let slot = handle.get();
                    (slot.id(), slot.address())
                })
                .collect()
        };

        LogsValue { logs, old_logs }
    }

    /// Snapshot of the configuration change counter.
    ///
    /// The counter strictly increases whenever any current or historical
    /// handle changes; [`Self::config_changed`] is the
    /// `on_log_system_config_change` contract.
    pub fn config_generation(&self) -> u64 {
        self.current
            .handles
            .iter()
            .chain(
                self.old_log_data
                    .iter()
                    .flat_map(|old| old.set.handles.iter()),
            )
            .map(LogServerHandle::generation)
            .sum()
    }

    /// True if any handle changed since the `since` snapshot.
    pub fn config_changed(&self, since: u64) -> bool {
        self.config_generation() != since
    }
}
