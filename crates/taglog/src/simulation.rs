//! Deterministic end-to-end scenarios.
//!
//! These tests drive the recovery, recruitment, and facade state machines
//! the way the shell would, with scripted log servers: every RPC the
//! machines emit is answered explicitly, so each scenario is fully
//! deterministic and replayable.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use taglog_types::{LocalityData, LogEpoch, NetworkAddress, Tag, Uid, Version};

use crate::config::{DatabaseConfig, Environment, Knobs, StoreType};
use crate::core_state::{DbCoreState, LogSystemType};
use crate::events::{CallId, LogSystemEvent, RejoinToken, TimerKind};
use crate::log_system::LogSystem;
use crate::message::{
    TLogInterface, TLogLockResult, TLogRejoinRequest, TLogReply, TLogRequest, WorkerInterface,
};
use crate::new_epoch::NewEpochRecruitment;
use crate::peek::PeekPlan;
use crate::policy::PolicyConfig;
use crate::push::PushData;
use crate::recovery::{EpochEndRecovery, RecoveryOutput};

// ============================================================================
// Environments
// ============================================================================

#[derive(Debug)]
struct SimEnv;

impl Environment for SimEnv {
    fn is_simulated(&self) -> bool {
        true
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn interface(id: Uid, zone: &str) -> TLogInterface {
    TLogInterface {
        id,
        address: NetworkAddress::new("10.0.0.1:4500".parse().unwrap()),
        locality: LocalityData::new().with_zone(zone),
    }
}

fn prev_state(zones: &[&str], replication: usize, anti_quorum: usize, policy: PolicyConfig) -> DbCoreState {
    DbCoreState {
        log_system_type: LogSystemType::TagPartitioned,
        tlogs: (0..zones.len()).map(|i| Uid::from_u64(i as u64 + 1)).collect(),
        tlog_localities: zones
            .iter()
            .map(|zone| LocalityData::new().with_zone(*zone))
            .collect(),
        tlog_replication_factor: replication,
        tlog_write_anti_quorum: anti_quorum,
        tlog_policy: policy,
        old_tlog_data: Vec::new(),
    }
}

fn lock_result(end: u64, known_committed: u64, tags: &[u32]) -> TLogLockResult {
    TLogLockResult {
        end: Version::new(end),
        known_committed_version: Version::new(known_committed),
        tags: tags.iter().map(|&t| Tag::new(t)).collect(),
    }
}

fn start_recovery(prev: DbCoreState) -> (EpochEndRecovery, RecoveryOutput) {
    EpochEndRecovery::start(
        Uid::from_u64(0),
        prev,
        LocalityData::new(),
        Knobs::simulation(),
        Arc::new(SimEnv),
    )
}

/// Announces server `n` (1-based uid) and returns the lock call it triggers.
fn rejoin(recovery: &mut EpochEndRecovery, n: u64, zone: &str, token: u64) -> CallId {
    let output = recovery.handle(LogSystemEvent::Rejoin(TLogRejoinRequest {
        interface: interface(Uid::from_u64(n), zone),
        reply: RejoinToken(token),
    }));
    output
        .actions
        .rpcs
        .iter()
        .rev()
        .find(|rpc| matches!(rpc.request, TLogRequest::Lock))
        .expect("rejoin of a current server triggers a lock attempt")
        .call
}

fn deliver_lock(
    recovery: &mut EpochEndRecovery,
    call: CallId,
    result: TLogLockResult,
) -> RecoveryOutput {
    recovery.handle(LogSystemEvent::Reply {
        call,
        reply: Ok(TLogReply::Locked(result)),
    })
}

/// Announce server `n`, then answer its lock.
fn join_and_lock(
    recovery: &mut EpochEndRecovery,
    n: u64,
    zone: &str,
    result: TLogLockResult,
) -> RecoveryOutput {
    let call = rejoin(recovery, n, zone, n * 100);
    deliver_lock(recovery, call, result)
}

// ============================================================================
// Recovery scenarios
// ============================================================================

#[test]
fn cold_start_publishes_an_empty_frozen_system() {
    let prev = DbCoreState {
        log_system_type: LogSystemType::TagPartitioned,
        tlogs: Vec::new(),
        tlog_localities: Vec::new(),
        tlog_replication_factor: 1,
        tlog_write_anti_quorum: 0,
        tlog_policy: PolicyConfig::One,
        old_tlog_data: Vec::new(),
    };

    let (mut recovery, output) = start_recovery(prev);
    let system = output.published.expect("cold start publishes immediately");
    assert_eq!(system.epoch_end_version(), Some(Version::ZERO));
    assert_eq!(system.known_committed_version(), Version::ZERO);
    assert_eq!(system.log_server_count(), 0);
    assert_eq!(
        system.to_core_state().unwrap().log_system_type,
        LogSystemType::TagPartitioned
    );

    // The machine is dormant afterwards; unknown rejoiners are dismissed.
    let output = recovery.handle(LogSystemEvent::Rejoin(TLogRejoinRequest {
        interface: interface(Uid::from_u64(5), "z1"),
        reply: RejoinToken(1),
    }));
    assert!(output.published.is_none());
    assert_eq!(output.actions.rejoin_replies, vec![(RejoinToken(1), true)]);
}

#[test]
fn three_logs_recover_at_the_earliest_end() {
    let prev = prev_state(&["z1", "z2", "z3"], 2, 0, PolicyConfig::One);
    let (mut recovery, output) = start_recovery(prev);
    // Nothing has rejoined yet: no locks, no candidate.
    assert!(output.actions.rpcs.is_empty());
    assert!(output.published.is_none());

    let _ = join_and_lock(&mut recovery, 1, "z1", lock_result(100, 80, &[0, 3]));
    let out_b = join_and_lock(&mut recovery, 2, "z2", lock_result(105, 85, &[1]));
    let out_c = join_and_lock(&mut recovery, 3, "z3", lock_result(103, 90, &[3, 7]));

    // Two locks already form a read quorum; the boundary settles at the
    // sorted results' anti-quorum index: 100.
    let system = out_b.published.expect("a read quorum publishes a candidate");
    assert_eq!(system.epoch_end_version(), Some(Version::new(100)));
    assert_eq!(system.get_end(), Version::new(101));

    // Known committed: the horizon floor is far below, so the maximum
    // reported by the responsive servers wins.
    assert_eq!(system.known_committed_version(), Version::new(85));

    // Tags seen across responsive servers are unioned.
    let tags: Vec<Tag> = system.epoch_end_tags().iter().copied().collect();
    assert_eq!(tags, vec![Tag::new(0), Tag::new(1), Tag::new(3)]);

    // The third server's slower-but-higher end does not move the boundary.
    assert!(out_c.published.is_none());
}

#[test]
fn straggler_regresses_the_recovery_boundary() {
    // Servers: 1 in z2; 2 and 3 in z1. With zone replication 2, the two
    // silent z1 servers do not form a complete replica set, so recovery may
    // proceed on the z2 server alone.
    let prev = prev_state(
        &["z2", "z1", "z1"],
        2,
        0,
        PolicyConfig::across(2, taglog_types::locality_keys::ZONE_ID),
    );
    let (mut recovery, _) = start_recovery(prev);

    let out = join_and_lock(&mut recovery, 1, "z2", lock_result(100, 0, &[]));
    let first = out.published.expect("first candidate publishes");
    assert_eq!(first.epoch_end_version(), Some(Version::new(100)));

    // A slower server reveals the boundary was premature: the safe range
    // now ends below the published end, so recovery restarts earlier.
    let out = join_and_lock(&mut recovery, 2, "z1", lock_result(95, 0, &[]));
    let second = out.published.expect("regression republishes");
    assert_eq!(second.epoch_end_version(), Some(Version::new(95)));
}

#[test]
fn recovery_waits_with_too_many_failures() {
    let prev = prev_state(&["z1", "z2", "z3"], 3, 0, PolicyConfig::One);
    let (mut recovery, _) = start_recovery(prev);

    // All three announce themselves; two then fail. The last lock reply is
    // still outstanding, so no read quorum exists and recovery must wait.
    let _call_a = rejoin(&mut recovery, 1, "z1", 1);
    let _call_b = rejoin(&mut recovery, 2, "z2", 2);
    let call_c = rejoin(&mut recovery, 3, "z3", 3);

    let out = recovery.handle(LogSystemEvent::Failure {
        server: Uid::from_u64(1),
        failed: true,
    });
    assert!(out.published.is_none());
    let out = recovery.handle(LogSystemEvent::Failure {
        server: Uid::from_u64(2),
        failed: true,
    });
    assert!(out.published.is_none());

    // Only when the surviving server's lock arrives can the epoch end.
    let out = deliver_lock(&mut recovery, call_c, lock_result(120, 100, &[]));
    let system = out.published.expect("survivor completes the read quorum");
    assert_eq!(system.epoch_end_version(), Some(Version::new(120)));
}

#[test]
fn anti_quorum_combinations_gate_recovery() {
    // Replication across 2 zones with anti-quorum 1. While the z2 server is
    // silent, a write acknowledged without the z1 server could live only on
    // {z2, z1-skipped}; recovery must wait for z2.
    let prev = prev_state(
        &["z1", "z2", "z2"],
        2,
        1,
        PolicyConfig::across(2, taglog_types::locality_keys::ZONE_ID),
    );
    let (mut recovery, _) = start_recovery(prev);

    let out = join_and_lock(&mut recovery, 1, "z1", lock_result(100, 0, &[]));
    assert!(out.published.is_none());
    let out = join_and_lock(&mut recovery, 2, "z2", lock_result(103, 0, &[]));
    assert!(out.published.is_none());

    let out = join_and_lock(&mut recovery, 3, "z2", lock_result(105, 0, &[]));
    let system = out.published.expect("full responses clear the sweep");
    // With anti-quorum 1 the boundary skips the smallest end.
    assert_eq!(system.epoch_end_version(), Some(Version::new(103)));
}

#[test]
fn simulation_horizon_bounds_known_committed() {
    let prev = prev_state(&["z1"], 1, 0, PolicyConfig::One);
    let (mut recovery, _) = start_recovery(prev);

    let knobs = Knobs::simulation();
    let horizon = 10 * knobs.versions_per_second;
    let end = horizon + 42;

    let out = join_and_lock(&mut recovery, 1, "z1", lock_result(end, 0, &[]));
    let system = out.published.expect("single server recovers alone");
    // No server reported anything newer, so the horizon floor applies.
    assert_eq!(system.known_committed_version(), Version::new(42));
}

#[test]
fn published_boundaries_only_regress() {
    // Property: across any order of lock arrivals, every republication
    // moves the boundary strictly earlier. Three servers share a zone so
    // candidates can appear early and regress as stragglers lock.
    let mut rng = SmallRng::seed_from_u64(0x7a67);
    for _ in 0..50 {
        let prev = prev_state(
            &["z1", "z2", "z2", "z2"],
            2,
            0,
            PolicyConfig::across(2, taglog_types::locality_keys::ZONE_ID),
        );
        let (mut recovery, _) = start_recovery(prev);

        let zones = ["z1", "z2", "z2", "z2"];
        let mut order: Vec<u64> = vec![1, 2, 3, 4];
        for i in (1..order.len()).rev() {
            let j = rng.gen_range(0..=i);
            order.swap(i, j);
        }

        let mut published = Vec::new();
        for &n in &order {
            let zone = zones[(n - 1) as usize];
            let end = rng.gen_range(50..150);
            let out = join_and_lock(&mut recovery, n, zone, lock_result(end, 0, &[]));
            if let Some(system) = out.published {
                published.push(system.epoch_end_version().unwrap());
            }
        }

        assert!(!published.is_empty());
        for pair in published.windows(2) {
            assert!(pair[1] < pair[0], "republication must regress: {published:?}");
        }
    }
}

// ============================================================================
// Full lifecycle: recover, recruit, serve, finish
// ============================================================================

fn worker(n: u64, zone: &str) -> WorkerInterface {
    WorkerInterface {
        id: Uid::from_u64(n),
        address: NetworkAddress::new("10.0.1.1:4500".parse().unwrap()),
        locality: LocalityData::new().with_zone(zone),
    }
}

#[test]
fn epoch_changeover_end_to_end() {
    // Recover a two-server single-copy epoch: with replication factor 1,
    // one silent server is a whole replica set, so both locks are needed
    // before the frozen system appears.
    let prev = prev_state(&["z1", "z2"], 1, 0, PolicyConfig::One);
    let (mut recovery, _) = start_recovery(prev);
    let out = join_and_lock(&mut recovery, 1, "z1", lock_result(200, 150, &[0, 1]));
    assert!(out.published.is_none());
    let out = join_and_lock(&mut recovery, 2, "z2", lock_result(205, 160, &[2]));
    let frozen = out.published.expect("both locks publish the frozen system");
    assert_eq!(frozen.epoch_end_version(), Some(Version::new(200)));

    // Recruit two fresh workers for the next epoch.
    let config = DatabaseConfig {
        tlog_replication_factor: 2,
        tlog_write_anti_quorum: 0,
        tlog_policy: PolicyConfig::across(2, taglog_types::locality_keys::ZONE_ID),
        tlog_store_type: StoreType::Memory,
    };
    let (mut recruitment, actions) = NewEpochRecruitment::start(
        &frozen,
        vec![worker(11, "z1"), worker(12, "z2")],
        &config,
        LogEpoch::new(1),
        Knobs::simulation(),
        Arc::new(SimEnv),
    );
    // Every epoch-end tag reaches some recruit's recover list.
    let mut recovered_tags: Vec<Tag> = actions
        .rpcs
        .iter()
        .flat_map(|rpc| match &rpc.request {
            TLogRequest::InitializeTLog(req) => req.recover_tags.clone(),
            _ => Vec::new(),
        })
        .collect();
    recovered_tags.sort_unstable();
    recovered_tags.dedup();
    assert_eq!(recovered_tags, vec![Tag::new(0), Tag::new(1), Tag::new(2)]);

    let mut ready = None;
    for (i, rpc) in actions.rpcs.iter().enumerate() {
        let out = recruitment.handle(LogSystemEvent::Reply {
            call: rpc.call,
            reply: Ok(TLogReply::TLogStarted(interface(
                Uid::from_u64(100 + i as u64),
                if i == 0 { "z1" } else { "z2" },
            ))),
        });
        if out.ready.is_some() {
            ready = Some((out.ready.unwrap(), out.actions));
        }
    }
    let (mut system, finish_actions) = ready.expect("unanimous recruitment");

    // The new system serves pushes while the old epochs stay peekable.
    assert!(system.epoch_end_version().is_none());
    assert_eq!(system.old_log_data().len(), 1);
    assert_eq!(system.old_log_data()[0].epoch_end, Version::new(161));

    let plan = system.peek(Version::new(100), Tag::new(1), false);
    let PeekPlan::Multi(multi) = plan else {
        panic!("pre-changeover reads stitch epochs");
    };
    assert_eq!(multi.segments[0].begin(), Version::new(161));
    assert_eq!(multi.segments[1].begin(), Version::new(100));
    assert_eq!(multi.segments[1].end(), Version::new(161));

    // Recovery finishes once both recruits report back.
    for rpc in &finish_actions.rpcs {
        let out = system.handle(LogSystemEvent::Reply {
            call: rpc.call,
            reply: Ok(TLogReply::RecoveryFinished),
        });
        if out.completions.is_empty() {
            continue;
        }
        assert_eq!(
            out.completions,
            vec![crate::events::Completion::RecoveryComplete]
        );
    }
    assert!(system.is_recovery_finished());

    // The master persists the drained state; old epochs disappear from the
    // advertised configuration and discovery export.
    let state = system.to_core_state().unwrap();
    assert!(state.old_tlog_data.is_empty());
    system.core_state_written(&state);
    assert!(system.get_log_system_config().old_tlogs.is_empty());
    assert!(system.get_logs_value().old_logs.is_empty());

    // Post-changeover reads come from the current epoch alone.
    let plan = system.peek(Version::new(161), Tag::new(1), true);
    assert!(matches!(plan, PeekPlan::Merged(_)));
}

// ============================================================================
// Facade scenarios
// ============================================================================

fn serving_system(zones: &[&str], anti_quorum: usize) -> LogSystem {
    let prev = prev_state(zones, 2.min(zones.len()), 0, PolicyConfig::One);
    let (mut recovery, _) = start_recovery(prev);
    let mut frozen = None;
    for (i, zone) in zones.iter().enumerate() {
        let n = i as u64 + 1;
        let out = join_and_lock(&mut recovery, n, zone, lock_result(1000, 900, &[]));
        if let Some(system) = out.published {
            frozen = Some(system);
        }
    }
    let frozen = frozen.expect("all locks publish");

    let config = DatabaseConfig {
        tlog_replication_factor: 2.min(zones.len()),
        tlog_write_anti_quorum: anti_quorum,
        tlog_policy: PolicyConfig::One,
        tlog_store_type: StoreType::Memory,
    };
    let workers: Vec<WorkerInterface> = zones
        .iter()
        .enumerate()
        .map(|(i, zone)| worker(20 + i as u64, zone))
        .collect();
    let (mut recruitment, actions) = NewEpochRecruitment::start(
        &frozen,
        workers,
        &config,
        LogEpoch::new(1),
        Knobs::simulation(),
        Arc::new(SimEnv),
    );
    let mut ready = None;
    for (i, rpc) in actions.rpcs.iter().enumerate() {
        let out = recruitment.handle(LogSystemEvent::Reply {
            call: rpc.call,
            reply: Ok(TLogReply::TLogStarted(interface(
                Uid::from_u64(200 + i as u64),
                zones[i],
            ))),
        });
        if let Some(system) = out.ready {
            ready = Some(system);
        }
    }
    ready.expect("recruitment completes")
}

#[test]
fn pops_stay_monotone_through_the_facade() {
    let mut system = serving_system(&["z1"], 0);

    let actions = system.pop(Version::new(50), Tag::new(7));
    assert_eq!(actions.timers.len(), 1);
    let kind = actions.timers[0].0;
    assert!(matches!(kind, TimerKind::PopWake { log: 0, tag } if tag == Tag::new(7)));

    // The later, lower pop is a no-op.
    let actions = system.pop(Version::new(40), Tag::new(7));
    assert!(actions.is_empty());

    let actions = system.handle(LogSystemEvent::Timeout(kind));
    assert_eq!(actions.rpcs.len(), 1);
    match &actions.rpcs[0].request {
        TLogRequest::Pop(req) => {
            assert_eq!(req.up_to, Version::new(50));
            assert_eq!(req.tag, Tag::new(7));
        }
        other => panic!("unexpected request {other:?}"),
    }

    // After the ack, the loop drains without sending anything else.
    let actions = system.handle(LogSystemEvent::Reply {
        call: actions.rpcs[0].call,
        reply: Ok(TLogReply::Popped),
    });
    assert_eq!(actions.timers.len(), 1);
    let actions = system.handle(LogSystemEvent::Timeout(kind));
    assert!(actions.rpcs.is_empty());
}

#[test]
fn push_quorum_with_anti_quorum_through_the_facade() {
    let mut system = serving_system(&["z1", "z2", "z3"], 1);

    let data = PushData::new(3);
    let (push, actions) = system.push(
        Version::new(1000),
        Version::new(1001),
        Version::new(900),
        &data,
        Some(Uid::from_u64(7)),
    );
    assert_eq!(actions.rpcs.len(), 3);

    // Two of three acks complete the push under anti-quorum 1.
    let calls: Vec<CallId> = actions.rpcs.iter().map(|rpc| rpc.call).collect();
    let out = system.handle(LogSystemEvent::Reply {
        call: calls[0],
        reply: Ok(TLogReply::Committed),
    });
    assert!(out.completions.is_empty());
    let out = system.handle(LogSystemEvent::Reply {
        call: calls[1],
        reply: Ok(TLogReply::Committed),
    });
    assert_eq!(
        out.completions,
        vec![crate::events::Completion::Push(push)]
    );
}

#[test]
fn commit_payloads_carry_per_location_slices() {
    let mut system = serving_system(&["z1", "z2", "z3"], 0);

    let set = system.current().locality_set();
    let mut data = PushData::new(3);
    data.add_message(
        &set,
        system.current().policy.clone().as_ref(),
        &[Tag::new(1)],
        b"payload",
    );

    let (_, actions) = system.push(
        Version::new(1000),
        Version::new(1001),
        Version::new(900),
        &data,
        None,
    );
    let slices: Vec<(usize, &TLogRequest)> = actions
        .rpcs
        .iter()
        .enumerate()
        .map(|(i, rpc)| (i, &rpc.request))
        .collect();
    for (i, request) in slices {
        let TLogRequest::Commit(req) = request else {
            panic!("expected commit");
        };
        if i == 1 {
            assert_eq!(&req.messages[..], b"payload");
            assert_eq!(req.tags, vec![Tag::new(1)]);
        } else {
            assert!(req.messages.is_empty());
            assert!(req.tags.is_empty());
        }
    }
}

#[test]
fn cold_started_system_can_be_recruited_over() {
    // A brand new database recovers to an empty frozen system, which the
    // first recruitment succeeds without any old data to pull.
    let prev = DbCoreState {
        log_system_type: LogSystemType::TagPartitioned,
        tlogs: Vec::new(),
        tlog_localities: Vec::new(),
        tlog_replication_factor: 1,
        tlog_write_anti_quorum: 0,
        tlog_policy: PolicyConfig::One,
        old_tlog_data: Vec::new(),
    };
    let (_, output) = start_recovery(prev);
    let frozen = output.published.unwrap();

    let config = DatabaseConfig {
        tlog_replication_factor: 1,
        tlog_write_anti_quorum: 0,
        tlog_policy: PolicyConfig::One,
        tlog_store_type: StoreType::Memory,
    };
    let (mut recruitment, actions) = NewEpochRecruitment::start(
        &frozen,
        vec![worker(1, "z1")],
        &config,
        LogEpoch::new(1),
        Knobs::simulation(),
        Arc::new(SimEnv),
    );
    let out = recruitment.handle(LogSystemEvent::Reply {
        call: actions.rpcs[0].call,
        reply: Ok(TLogReply::TLogStarted(interface(Uid::from_u64(100), "z1"))),
    });
    let system = out.ready.expect("bootstrap recruitment completes");
    assert!(system.old_log_data().is_empty());
    assert!(system.epoch_end_version().is_none());
}

#[test]
fn pop_interval_comes_from_the_knobs() {
    let mut system = serving_system(&["z1"], 0);
    let actions = system.pop(Version::new(5), Tag::new(0));
    assert_eq!(actions.timers[0].1, Knobs::simulation().pop_batch_interval);
    assert_ne!(actions.timers[0].1, Duration::ZERO);
}
