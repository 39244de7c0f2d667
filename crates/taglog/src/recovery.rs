//! Epoch-end recovery.
//!
//! Recovery stops a co-quorum of the previous epoch's log servers so that no
//! further versions can be committed until the coordinated state changes,
//! and publishes a frozen [`LogSystem`] describing the recoverable boundary.
//! The machine never finishes on its own: every lock reply, failure
//! transition, or rejoin re-evaluates the candidate, and a better (earlier)
//! boundary is re-published. The owner drops the machine once a new epoch
//! has been recruited.

use std::collections::HashMap;
use std::sync::Arc;

use taglog_types::{read_quorum, LocalityData, Uid, Version};
use tracing::{debug, info, warn};

use crate::config::{Environment, Knobs};
use crate::core_state::{DbCoreState, LogSystemType};
use crate::events::{Actions, CallId, CallIdGen, LogSystemEvent, OutboundRpc, RpcTarget};
use crate::handle::LogServerHandle;
use crate::log_system::{LogSystem, OldLogData, TLogSet};
use crate::message::{OptionalInterface, TLogLockResult, TLogReply, TLogRequest};
use crate::monitor::FailureMonitor;
use crate::policy::{validate_all_combinations, ReplicationPolicy};
use crate::rejoin::RejoinTracker;

// ============================================================================
// Recovery Output
// ============================================================================

/// Output of one recovery step.
#[derive(Debug, Default)]
pub struct RecoveryOutput {
    /// RPCs, timers, and rejoin replies to execute.
    pub actions: Actions,

    /// A new frozen log system candidate, when one was published.
    pub published: Option<LogSystem>,
}

impl RecoveryOutput {
    fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Epoch End Recovery
// ============================================================================

/// The recovery state machine for one previous epoch.
#[derive(Debug)]
pub struct EpochEndRecovery {
    dbgid: Uid,
    prev: DbCoreState,
    policy: Arc<dyn ReplicationPolicy>,
    locality: LocalityData,
    knobs: Knobs,
    env: Arc<dyn Environment>,

    handles: Vec<LogServerHandle>,
    old_log_data: Vec<OldLogData>,
    monitors: Vec<FailureMonitor>,
    rejoins: Option<RejoinTracker>,

    lock_calls: HashMap<CallId, usize>,
    lock_results: Vec<Option<TLogLockResult>>,
    lock_sent_generation: Vec<Option<u64>>,

    last_end: Option<Version>,
    cycles: u64,
    calls: CallIdGen,
    dormant: bool,
}

impl EpochEndRecovery {
    /// Starts recovering from `prev_state`.
    ///
    /// For a brand new database (no previous servers) the frozen system is
    /// published immediately and the machine goes dormant.
    ///
    /// # Panics
    ///
    /// Panics if `prev_state` violates the replication preconditions; the
    /// state was validated when it was written, so this is an invariant
    /// violation.
    pub fn start(
        dbgid: Uid,
        prev_state: DbCoreState,
        locality: LocalityData,
        knobs: Knobs,
        env: Arc<dyn Environment>,
    ) -> (Self, RecoveryOutput) {
        let policy = prev_state.tlog_policy.build();
        let mut output = RecoveryOutput::new();

        if prev_state.tlogs.is_empty() {
            info!(dbgid = %dbgid, "recovering a brand new database");
            let current = TLogSet {
                handles: Vec::new(),
                localities: prev_state.tlog_localities.clone(),
                replication_factor: prev_state.tlog_replication_factor,
                write_anti_quorum: prev_state.tlog_write_anti_quorum,
                policy: policy.clone(),
            };
            let mut system = LogSystem::bare(dbgid, locality.clone(), current, knobs.clone());
            system.log_system_type = prev_state.log_system_type;
            system.epoch_end_version = Some(Version::ZERO);
            system.known_committed_version = Version::ZERO;
            output.published = Some(system);

            let recovery = Self {
                dbgid,
                prev: prev_state,
                policy,
                locality,
                knobs,
                env,
                handles: Vec::new(),
                old_log_data: Vec::new(),
                monitors: Vec::new(),
                rejoins: Some(RejoinTracker::new(dbgid, Vec::new())),
                lock_calls: HashMap::new(),
                lock_results: Vec::new(),
                lock_sent_generation: Vec::new(),
                last_end: None,
                cycles: 0,
                calls: CallIdGen::new(),
                dormant: true,
            };
            return (recovery, output);
        }

        let n = prev_state.tlogs.len();
        let replication = prev_state.tlog_replication_factor;
        let anti_quorum = prev_state.tlog_write_anti_quorum;

        // A replica set must always contain at least one server that is in
        // both the write quorum and the read quorum: with W = anti-quorum
        // and R = required count, W + (N - R) < F, optimally R = N + 1 - F + W.
        let required = read_quorum(n, replication, anti_quorum);
        assert!(
            required > 0 && required <= n,
            "read quorum out of range for previous epoch"
        );
        assert!(
            (1..=n).contains(&replication),
            "replication factor out of range for previous epoch"
        );
        assert!(
            anti_quorum < n,
            "write anti-quorum out of range for previous epoch"
        );

        let handles: Vec<LogServerHandle> = prev_state
            .tlogs
            .iter()
            .map(|&id| LogServerHandle::new(OptionalInterface::id_only(id)))
            .collect();
        let monitors: Vec<FailureMonitor> = handles
            .iter()
            .map(|handle| FailureMonitor::new(handle.clone()))
            .collect();

        let mut all_handles = handles.clone();
        let old_log_data: Vec<OldLogData> = prev_state
            .old_tlog_data
            .iter()
            .map(|old| {
                let old_handles: Vec<LogServerHandle> = old
                    .tlogs
                    .iter()
                    .map(|&id| LogServerHandle::new(OptionalInterface::id_only(id)))
                    .collect();
                all_handles.extend(old_handles.iter().cloned());
                OldLogData {
                    set: TLogSet {
                        handles: old_handles,
                        localities: old.tlog_localities.clone(),
                        replication_factor: old.tlog_replication_factor,
                        write_anti_quorum: old.tlog_write_anti_quorum,
                        policy: old.tlog_policy.build(),
                    },
                    epoch_end: old.epoch_end,
                }
            })
            .collect();

        let mut recovery = Self {
            dbgid,
            prev: prev_state,
            policy,
            locality,
            knobs,
            env,
            handles,
            old_log_data,
            monitors,
            rejoins: Some(RejoinTracker::new(dbgid, all_handles)),
            lock_calls: HashMap::new(),
            lock_results: vec![None; n],
            lock_sent_generation: vec![None; n],
            last_end: None,
            cycles: 0,
            calls: CallIdGen::new(),
            dormant: false,
        };

        for index in 0..n {
            recovery.send_lock(index, &mut output.actions);
        }
        recovery.evaluate(&mut output);
        (recovery, output)
    }

    /// Processes one event and re-evaluates the candidate.
    pub fn handle(&mut self, event: LogSystemEvent) -> RecoveryOutput {
        let mut output = RecoveryOutput::new();

        match event {
            LogSystemEvent::Reply { call, reply } => {
                if let Some(index) = self.lock_calls.remove(&call) {
                    match reply {
                        Ok(TLogReply::Locked(result)) => {
                            info!(
                                dbgid = %self.dbgid,
                                log = index,
                                end = %result.end,
                                known_committed = %result.known_committed_version,
                                "log server locked"
                            );
                            self.lock_results[index] = Some(result);
                        }
                        Ok(other) => {
                            warn!(dbgid = %self.dbgid, log = index, ?other, "unexpected lock reply");
                        }
                        // A vanished server is observed through the failure
                        // monitor; the lock attempt re-arms on the next
                        // handle change.
                        Err(fault) => {
                            debug!(dbgid = %self.dbgid, log = index, %fault, "lock attempt failed");
                        }
                    }
                }
            }
            LogSystemEvent::Failure { server, failed } => {
                for monitor in &mut self.monitors {
                    monitor.note_failure(server, failed);
                }
            }
            LogSystemEvent::Rejoin(request) => match &mut self.rejoins {
                Some(tracker) => {
                    tracker.handle(request, &mut output.actions);
                }
                None => {
                    debug!(dbgid = %self.dbgid, "rejoin after stop_rejoins left pending");
                }
            },
            LogSystemEvent::Timeout(_) => {}
        }

        if self.dormant {
            return output;
        }

        self.rearm(&mut output.actions);
        self.evaluate(&mut output);
        output
    }

    /// Stops absorbing rejoins, answering every pending announcer.
    pub fn stop_rejoins(&mut self) -> Actions {
        match self.rejoins.take() {
            Some(tracker) => tracker.shutdown(),
            None => Actions::empty(),
        }
    }

    /// Terminates the machine; pending rejoiners are told to stop.
    pub fn shutdown(mut self) -> Actions {
        self.stop_rejoins()
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Re-arms monitors and lock attempts for handles that changed.
    fn rearm(&mut self, actions: &mut Actions) {
        for index in 0..self.handles.len() {
            self.monitors[index].refresh();
            let generation = self.handles[index].generation();
            if self.lock_sent_generation[index] != Some(generation) {
                self.send_lock(index, actions);
            }
        }
    }

    fn send_lock(&mut self, index: usize, actions: &mut Actions) {
        let generation = self.handles[index].generation();
        self.lock_sent_generation[index] = Some(generation);

        // Replies to attempts against a replaced interface are stale.
        self.lock_calls.retain(|_, i| *i != index);

        let slot = self.handles[index].get();
        let Some(interface) = slot.interf() else {
            return;
        };
        let call = self.calls.next();
        self.lock_calls.insert(call, index);
        info!(dbgid = %self.dbgid, server = %interface.id, "locking log server");
        actions.rpcs.push(OutboundRpc {
            call,
            target: RpcTarget::Log(interface.clone()),
            request: TLogRequest::Lock,
            deadline: None,
        });
    }

    // ========================================================================
    // Candidate evaluation
    // ========================================================================

    fn evaluate(&mut self, output: &mut RecoveryOutput) {
        self.cycles += 1;
        let n = self.handles.len();
        let replication = self.prev.tlog_replication_factor;
        let anti_quorum = self.prev.tlog_write_anti_quorum;

        let mut results: Vec<TLogLockResult> = Vec::new();
        let mut available: Vec<LocalityData> = Vec::new();
        let mut unresponsive: Vec<LocalityData> = Vec::new();
        let mut server_state = String::new();
        for index in 0..n {
            let failed = self.monitors[index].flag().get();
            match (&self.lock_results[index], failed) {
                (Some(result), false) => {
                    results.push(result.clone());
                    available.push(self.prev.tlog_localities[index].clone());
                    server_state.push('a');
                }
                _ => {
                    unresponsive.push(self.prev.tlog_localities[index].clone());
                    server_state.push('f');
                }
            }
        }

        let mut too_many = results.len() <= anti_quorum;
        too_many = too_many
            || (unresponsive.len() >= replication && self.policy.validate(&unresponsive));

        if !too_many && anti_quorum > 0 {
            let mut bad_combo = Vec::new();
            if !validate_all_combinations(
                &mut bad_combo,
                &unresponsive,
                self.policy.as_ref(),
                &available,
                anti_quorum,
                false,
            ) {
                warn!(
                    dbgid = %self.dbgid,
                    cycles = self.cycles,
                    present = results.len(),
                    bad_zones = %LocalityData::describe_zones(&bad_combo),
                    "an anti-quorum combination could complete an unrecoverable replica set"
                );
                too_many = true;
            }
        }

        if too_many {
            info!(
                dbgid = %self.dbgid,
                cycles = self.cycles,
                total = n,
                present = results.len(),
                absent = n - results.len(),
                server_state = %server_state,
                replication,
                anti_quorum,
                policy = %self.policy.name(),
                zones = %LocalityData::describe_zones(&self.prev.tlog_localities),
                data_halls = %LocalityData::describe_data_halls(&self.prev.tlog_localities),
                "waiting for log servers before recovery can proceed"
            );
            return;
        }

        results.sort_by_key(|result| result.end);
        let absent = n - results.len();
        let safe_range_begin = anti_quorum;
        let new_safe_range_begin = anti_quorum.min(results.len() - 1);
        let safe_range_end = replication as i64 - absent as i64;

        let end = results[new_safe_range_begin].end;
        let horizon = self.knobs.known_committed_horizon(self.env.as_ref());
        let mut known_committed = end.saturating_back(horizon);
        for result in &results {
            known_committed = known_committed.max(result.known_committed_version);
        }

        let regressed = safe_range_end > 0
            && ((safe_range_end - 1) as usize) < results.len()
            && self
                .last_end
                .is_some_and(|last| results[(safe_range_end - 1) as usize].end < last);
        let should_publish = self.prev.log_system_type == LogSystemType::TagPartitioned
            && (self.last_end.is_none() || regressed);

        if !should_publish {
            info!(
                dbgid = %self.dbgid,
                cycles = self.cycles,
                end = %end,
                last_end = ?self.last_end,
                server_state = %server_state,
                "recovery candidate unchanged"
            );
            return;
        }

        info!(
            dbgid = %self.dbgid,
            cycles = self.cycles,
            total = n,
            present = results.len(),
            absent,
            server_state = %server_state,
            replication,
            anti_quorum,
            policy = %self.policy.name(),
            last_end = ?self.last_end,
            end = %end,
            known_committed = %known_committed,
            safe_begin = safe_range_begin,
            safe_end = safe_range_end,
            new_safe_begin = new_safe_range_begin,
            "publishing recovered log system"
        );

        self.last_end = Some(end);

        let current = TLogSet {
            handles: self.handles.clone(),
            localities: self.prev.tlog_localities.clone(),
            replication_factor: replication,
            write_anti_quorum: anti_quorum,
            policy: self.policy.clone(),
        };
        let mut system = LogSystem::bare(
            self.dbgid,
            self.locality.clone(),
            current,
            self.knobs.clone(),
        );
        system.log_system_type = self.prev.log_system_type;
        system.old_log_data = self.old_log_data.clone();
        system.epoch_end_version = Some(end);
        system.known_committed_version = known_committed;
        for result in &results {
            system.epoch_end_tags.extend(result.tags.iter().copied());
        }
        output.published = Some(system);
    }
}
