//! Pop coalescing.
//!
//! Popping a tag fans out to every log of the epoch, but per `(log, tag)`
//! only the highest requested version matters. [`PopTracker`] keeps one
//! logical loop per key: a [`TimerKind::PopWake`] fires at the coalescing
//! interval, the loop sends at most one pop RPC for whatever the key's
//! current target is, and exits (removing the key) once the target has
//! been sent.
//!
//! A fault leaves the key populated so no further pop loop is started for
//! that server from this log system.

use std::collections::HashMap;
use std::time::Duration;

use taglog_types::{Tag, Version};
use tracing::{error, info};

use crate::events::{Actions, CallId, CallIdGen, OutboundRpc, RpcTarget, TimerKind};
use crate::handle::LogServerHandle;
use crate::message::{PopRequest, TLogFault, TLogReply, TLogRequest};

// ============================================================================
// Pop Tracker
// ============================================================================

#[derive(Debug)]
struct PopEntry {
    /// Highest version requested so far; only ever increases.
    target: Version,

    /// Highest version successfully sent.
    last_sent: Version,

    /// An RPC is outstanding for this key.
    sending: bool,

    /// The loop ended on a fault; the key stays to block new loops.
    dead: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlightPop {
    log: usize,
    tag: Tag,
    to: Version,
}

/// Coalesces pop requests per `(log, tag)`.
#[derive(Debug)]
pub(crate) struct PopTracker {
    interval: Duration,
    entries: HashMap<(usize, Tag), PopEntry>,
    in_flight: HashMap<CallId, InFlightPop>,
}

impl PopTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Raises the pop target for `tag` on every log; starts a loop for keys
    /// that had none.
    pub fn pop(&mut self, up_to: Version, tag: Tag, num_logs: usize, actions: &mut Actions) {
        if num_logs == 0 || up_to.is_zero() {
            return;
        }
        for log in 0..num_logs {
            match self.entries.entry((log, tag)) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if entry.target < up_to {
                        entry.target = up_to;
                    }
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(PopEntry {
                        target: up_to,
                        last_sent: Version::ZERO,
                        sending: false,
                        dead: false,
                    });
                    actions
                        .timers
                        .push((TimerKind::PopWake { log, tag }, self.interval));
                }
            }
        }
    }

    /// One iteration of the loop for `(log, tag)`.
    pub fn on_wake(
        &mut self,
        log: usize,
        tag: Tag,
        handles: &[LogServerHandle],
        calls: &mut CallIdGen,
        actions: &mut Actions,
    ) {
        let key = (log, tag);
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if entry.dead || entry.sending {
            return;
        }

        let to = entry.target;
        if to <= entry.last_sent {
            // Fully drained: the loop ends and the key is released.
            self.entries.remove(&key);
            return;
        }

        let interface = handles.get(log).and_then(|handle| handle.get().interf().cloned());
        let Some(interface) = interface else {
            // The server is gone from the slot; stop popping it.
            entry.dead = true;
            return;
        };

        let call = calls.next();
        entry.sending = true;
        self.in_flight.insert(
            call,
            InFlightPop { log, tag, to },
        );
        actions.rpcs.push(OutboundRpc {
            call,
            target: RpcTarget::Log(interface),
            request: TLogRequest::Pop(PopRequest { up_to: to, tag }),
            deadline: None,
        });
    }

    /// Routes a pop reply; returns false if the call is not ours.
    pub fn on_reply(
        &mut self,
        call: CallId,
        result: &Result<TLogReply, TLogFault>,
        actions: &mut Actions,
    ) -> bool {
        let Some(pending) = self.in_flight.remove(&call) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(&(pending.log, pending.tag)) else {
            return true;
        };
        entry.sending = false;

        match result {
            Ok(_) => {
                entry.last_sent = pending.to;
                actions.timers.push((
                    TimerKind::PopWake {
                        log: pending.log,
                        tag: pending.tag,
                    },
                    self.interval,
                ));
            }
            Err(TLogFault::BrokenPromise) => {
                info!(log = pending.log, tag = %pending.tag, "pop target gone");
                entry.dead = true;
            }
            Err(fault) => {
                error!(log = pending.log, tag = %pending.tag, %fault, "pop failed");
                entry.dead = true;
            }
        }
        true
    }

    /// Number of live keys, for tests and introspection.
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taglog_types::{LocalityData, NetworkAddress, Uid};

    use crate::message::{OptionalInterface, TLogInterface};

    fn handles(n: usize) -> Vec<LogServerHandle> {
        (0..n)
            .map(|i| {
                LogServerHandle::new(OptionalInterface::known(TLogInterface {
                    id: Uid::from_u64(i as u64),
                    address: NetworkAddress::empty(),
                    locality: LocalityData::new(),
                }))
            })
            .collect()
    }

    fn wake(
        tracker: &mut PopTracker,
        log: usize,
        tag: Tag,
        handles: &[LogServerHandle],
        calls: &mut CallIdGen,
    ) -> Actions {
        let mut actions = Actions::empty();
        tracker.on_wake(log, tag, handles, calls, &mut actions);
        actions
    }

    #[test]
    fn coalesces_to_the_maximum_target() {
        let handles = handles(1);
        let mut calls = CallIdGen::new();
        let mut tracker = PopTracker::new(Duration::from_millis(10));
        let tag = Tag::new(7);

        let mut actions = Actions::empty();
        tracker.pop(Version::new(50), tag, 1, &mut actions);
        assert_eq!(actions.timers.len(), 1);

        // A lower later request is a no-op: no new loop, target unchanged.
        let mut actions = Actions::empty();
        tracker.pop(Version::new(40), tag, 1, &mut actions);
        assert!(actions.timers.is_empty());

        // The loop sends exactly one RPC, for the maximum.
        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert_eq!(actions.rpcs.len(), 1);
        let call = actions.rpcs[0].call;
        match &actions.rpcs[0].request {
            TLogRequest::Pop(req) => {
                assert_eq!(req.up_to, Version::new(50));
                assert_eq!(req.tag, tag);
            }
            other => panic!("unexpected request {other:?}"),
        }

        // Ack, then the next wake drains the key.
        let mut actions = Actions::empty();
        assert!(tracker.on_reply(call, &Ok(TLogReply::Popped), &mut actions));
        assert_eq!(actions.timers.len(), 1);

        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert!(actions.rpcs.is_empty());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn at_most_one_in_flight_per_key() {
        let handles = handles(1);
        let mut calls = CallIdGen::new();
        let mut tracker = PopTracker::new(Duration::from_millis(10));
        let tag = Tag::new(3);

        let mut actions = Actions::empty();
        tracker.pop(Version::new(10), tag, 1, &mut actions);

        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert_eq!(actions.rpcs.len(), 1);

        // A second wake while the RPC is outstanding sends nothing.
        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert!(actions.rpcs.is_empty());
    }

    #[test]
    fn target_raised_while_in_flight_is_sent_next_round() {
        let handles = handles(1);
        let mut calls = CallIdGen::new();
        let mut tracker = PopTracker::new(Duration::from_millis(10));
        let tag = Tag::new(1);

        let mut actions = Actions::empty();
        tracker.pop(Version::new(10), tag, 1, &mut actions);
        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        let call = actions.rpcs[0].call;

        let mut actions = Actions::empty();
        tracker.pop(Version::new(20), tag, 1, &mut actions);
        assert!(actions.timers.is_empty());

        let mut actions = Actions::empty();
        tracker.on_reply(call, &Ok(TLogReply::Popped), &mut actions);

        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert_eq!(actions.rpcs.len(), 1);
        match &actions.rpcs[0].request {
            TLogRequest::Pop(req) => assert_eq!(req.up_to, Version::new(20)),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn broken_promise_blocks_future_loops_for_the_key() {
        let handles = handles(1);
        let mut calls = CallIdGen::new();
        let mut tracker = PopTracker::new(Duration::from_millis(10));
        let tag = Tag::new(2);

        let mut actions = Actions::empty();
        tracker.pop(Version::new(10), tag, 1, &mut actions);
        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        let call = actions.rpcs[0].call;

        let mut actions = Actions::empty();
        tracker.on_reply(call, &Err(TLogFault::BrokenPromise), &mut actions);
        assert_eq!(tracker.outstanding(), 1);

        // Another pop updates the target but starts no loop, and a stray
        // wake stays quiet.
        let mut actions = Actions::empty();
        tracker.pop(Version::new(99), tag, 1, &mut actions);
        assert!(actions.timers.is_empty());
        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert!(actions.rpcs.is_empty());
    }

    #[test]
    fn absent_interface_ends_the_loop_with_key_present() {
        let handle = LogServerHandle::new(OptionalInterface::id_only(Uid::from_u64(0)));
        let handles = vec![handle];
        let mut calls = CallIdGen::new();
        let mut tracker = PopTracker::new(Duration::from_millis(10));
        let tag = Tag::new(4);

        let mut actions = Actions::empty();
        tracker.pop(Version::new(5), tag, 1, &mut actions);
        let actions = wake(&mut tracker, 0, tag, &handles, &mut calls);
        assert!(actions.rpcs.is_empty());
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn fans_out_to_every_log() {
        let mut tracker = PopTracker::new(Duration::from_millis(10));
        let mut actions = Actions::empty();
        tracker.pop(Version::new(5), Tag::new(0), 3, &mut actions);
        assert_eq!(actions.timers.len(), 3);
        assert_eq!(tracker.outstanding(), 3);
    }
}
