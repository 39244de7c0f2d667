//! New epoch recruitment.
//!
//! Called only after epoch-end recovery froze the previous epoch. Every
//! offered worker is initialized in parallel with the recovery metadata and
//! its share of the epoch-end tags; unlike pushes, recruitment requires
//! unanimity. The produced log system is provisional until the master
//! persists the corresponding core state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use taglog_types::{LocalityData, LogEpoch, Uid};
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, Environment, Knobs};
use crate::events::{Actions, CallId, CallIdGen, LogSystemEvent, OutboundRpc, RpcTarget, TimerKind};
use crate::handle::LogServerHandle;
use crate::log_system::{LogSystem, OldLogData, RecoveryStatus, TLogSet};
use crate::message::{
    InitializeTLogRequest, OptionalInterface, TLogFault, TLogInterface, TLogReply, TLogRequest,
    WorkerInterface,
};
use crate::policy::ReplicationPolicy;
use crate::LogError;

// ============================================================================
// Recruitment Output
// ============================================================================

/// Output of one recruitment step.
#[derive(Debug, Default)]
pub struct RecruitOutput {
    /// RPCs and timers to execute.
    pub actions: Actions,

    /// The active log system, once every worker initialized.
    pub ready: Option<LogSystem>,
}

// ============================================================================
// New Epoch Recruitment
// ============================================================================

/// Recruits a fresh log server set for the epoch after a frozen one.
#[derive(Debug)]
pub struct NewEpochRecruitment {
    dbgid: Uid,
    locality: LocalityData,
    knobs: Knobs,
    env: Arc<dyn Environment>,

    replication_factor: usize,
    write_anti_quorum: usize,
    policy: Arc<dyn ReplicationPolicy>,
    recruitment_id: Uid,

    workers: Vec<WorkerInterface>,
    old_log_data: Vec<OldLogData>,

    init_calls: HashMap<CallId, usize>,
    replies: Vec<Option<TLogInterface>>,
    failed: bool,
    calls: CallIdGen,
}

impl NewEpochRecruitment {
    /// Starts recruiting `workers` to succeed the frozen `old_system`.
    ///
    /// # Panics
    ///
    /// Panics if `old_system` has not been frozen by recovery, or if
    /// `workers` is empty.
    pub fn start(
        old_system: &LogSystem,
        workers: Vec<WorkerInterface>,
        config: &DatabaseConfig,
        recovery_count: LogEpoch,
        knobs: Knobs,
        env: Arc<dyn Environment>,
    ) -> (Self, Actions) {
        let recover_at = old_system
            .epoch_end_version()
            .expect("new epoch requires a frozen predecessor");
        assert!(!workers.is_empty(), "recruitment requires candidate workers");

        let policy = config.tlog_policy.build();
        let recruitment_id = Uid::random();
        info!(
            dbgid = %old_system.dbgid(),
            recruitment = %recruitment_id,
            workers = workers.len(),
            epoch = %recovery_count,
            recover_at = %recover_at,
            "recruiting new log epoch"
        );

        // The frozen epoch becomes the newest old entry; it hands over at
        // the first version past what every replica is known to hold.
        let mut old_log_data = Vec::new();
        if !old_system.current().is_empty() {
            old_log_data.push(OldLogData {
                set: old_system.current().clone(),
                epoch_end: old_system.known_committed_version().next(),
            });
        }
        old_log_data.extend(old_system.old_log_data().iter().cloned());
        debug_assert!(
            old_log_data
                .windows(2)
                .all(|pair| pair[1].epoch_end <= pair[0].epoch_end),
            "old epoch ends must be non-increasing"
        );

        // Route each epoch-end tag to the workers that will serve it.
        let worker_set = crate::locality::LocalitySet::from_workers(&workers);
        let mut recover_tags: Vec<Vec<taglog_types::Tag>> = vec![Vec::new(); workers.len()];
        for &tag in old_system.epoch_end_tags() {
            for location in worker_set.push_locations(policy.as_ref(), &[tag]) {
                recover_tags[location].push(tag);
            }
        }

        let recover_from = old_system.get_log_system_config();
        let mut recruitment = Self {
            dbgid: old_system.dbgid(),
            locality: old_system.locality.clone(),
            knobs,
            env,
            replication_factor: config.tlog_replication_factor,
            write_anti_quorum: config.tlog_write_anti_quorum,
            policy,
            recruitment_id,
            replies: vec![None; workers.len()],
            workers,
            old_log_data,
            init_calls: HashMap::new(),
            failed: false,
            calls: CallIdGen::new(),
        };

        let mut actions = Actions::empty();
        for (index, worker) in recruitment.workers.iter().enumerate() {
            let call = recruitment.calls.next();
            recruitment.init_calls.insert(call, index);
            actions.rpcs.push(OutboundRpc {
                call,
                target: RpcTarget::Worker(worker.clone()),
                request: TLogRequest::InitializeTLog(Box::new(InitializeTLogRequest {
                    recruitment_id,
                    store_type: config.tlog_store_type,
                    recover_from: recover_from.clone(),
                    recover_at,
                    known_committed_version: old_system.known_committed_version(),
                    epoch: recovery_count,
                    recover_tags: std::mem::take(&mut recover_tags[index]),
                })),
                deadline: Some(recruitment.knobs.tlog_timeout),
            });
        }
        (recruitment, actions)
    }

    /// Processes one event.
    pub fn handle(&mut self, event: LogSystemEvent) -> RecruitOutput {
        let mut output = RecruitOutput::default();
        if self.failed {
            return output;
        }

        match event {
            LogSystemEvent::Reply { call, reply } => {
                self.on_init_reply(call, reply, &mut output);
            }
            LogSystemEvent::Timeout(TimerKind::CallDeadline(call)) => {
                self.on_init_reply(call, Err(TLogFault::Timeout), &mut output);
            }
            LogSystemEvent::Timeout(_) | LogSystemEvent::Failure { .. } => {}
            LogSystemEvent::Rejoin(request) => {
                debug!(dbgid = %self.dbgid, server = %request.interface.id, "rejoin during recruitment left pending");
            }
        }
        output
    }

    fn on_init_reply(
        &mut self,
        call: CallId,
        reply: Result<TLogReply, TLogFault>,
        output: &mut RecruitOutput,
    ) {
        let Some(index) = self.init_calls.remove(&call) else {
            return;
        };
        match reply {
            Ok(TLogReply::TLogStarted(interface)) => {
                debug!(dbgid = %self.dbgid, worker = index, server = %interface.id, "log server initialized");
                self.replies[index] = Some(interface);
                if self.replies.iter().all(Option::is_some) {
                    self.finish(output);
                }
            }
            Ok(other) => {
                warn!(dbgid = %self.dbgid, worker = index, ?other, "unexpected initialization reply");
                self.fail(output);
            }
            Err(fault) => {
                warn!(dbgid = %self.dbgid, worker = index, %fault, "log server initialization failed");
                self.fail(output);
            }
        }
    }

    fn fail(&mut self, output: &mut RecruitOutput) {
        self.failed = true;
        output.actions.fail(LogError::MasterRecoveryFailed {
            reason: "log server initialization failed",
        });
    }

    fn finish(&mut self, output: &mut RecruitOutput) {
        // Deliberately exercise the recruitment restart path when the
        // simulation asks for fault injection.
        if self.env.is_simulated() && self.env.speed_up_simulation() && self.env.buggify() {
            warn!(dbgid = %self.dbgid, "injected recruitment failure");
            self.failed = true;
            output.actions.fail(LogError::MasterRecoveryFailed {
                reason: "injected recruitment failure",
            });
            return;
        }

        let handles: Vec<LogServerHandle> = self
            .replies
            .iter()
            .map(|reply| {
                let interface = reply.clone().expect("finish requires unanimity");
                LogServerHandle::new(OptionalInterface::known(interface))
            })
            .collect();
        let localities: Vec<LocalityData> = self
            .workers
            .iter()
            .map(|worker| worker.locality.clone())
            .collect();

        let current = TLogSet {
            handles,
            localities,
            replication_factor: self.replication_factor,
            write_anti_quorum: self.write_anti_quorum,
            policy: self.policy.clone(),
        };
        let mut system = LogSystem::bare(
            self.dbgid,
            self.locality.clone(),
            current,
            self.knobs.clone(),
        );
        system.old_log_data = std::mem::take(&mut self.old_log_data);
        system.calls = std::mem::take(&mut self.calls);

        // Recovery is finished once every recruited server says so; the
        // facade tracks the outstanding calls from here on.
        let mut outstanding = HashSet::new();
        for handle in &system.current.handles {
            let interface = handle
                .get()
                .interf()
                .cloned()
                .expect("recruited handle holds an interface");
            let call = system.calls.next();
            outstanding.insert(call);
            output.actions.rpcs.push(OutboundRpc {
                call,
                target: RpcTarget::Log(interface),
                request: TLogRequest::RecoveryFinished,
                deadline: Some(self.knobs.tlog_timeout),
            });
        }
        system.recovery = RecoveryStatus::Pending(outstanding);

        info!(
            dbgid = %self.dbgid,
            recruitment = %self.recruitment_id,
            servers = %system.describe(),
            "new log epoch recruited"
        );
        output.ready = Some(system);
    }
}
