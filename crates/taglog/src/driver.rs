//! Event loop driver for a log system.
//!
//! The state machines in this crate are pure; this module is the imperative
//! shell that runs one [`LogSystem`] on a dedicated thread. It owns the
//! transport and the clock:
//!
//! 1. Receive commands from the master and events from the transport
//! 2. Fire requested timers as they expire
//! 3. Drive [`LogSystem::handle`] / the operation entry points
//! 4. Send outbound RPCs, forward completions and rejoin decisions
//!
//! All mutation of the log system happens on the driver thread; the master
//! talks to it through channels, mirroring the single-threaded cooperative
//! model the protocol assumes.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use taglog_types::{Tag, Uid, Version};
use tracing::{debug, trace};

use crate::events::{Actions, Completion, LogSystemEvent, OutboundRpc, RejoinToken, TimerKind};
use crate::log_system::LogSystem;
use crate::push::PushData;
use crate::{LogError, Result};

/// Poll interval while no timer is armed.
const IDLE_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Transport
// ============================================================================

/// Sends RPCs to log servers and workers.
///
/// Fire-and-forget from the driver's point of view: replies and terminal
/// faults come back as [`LogSystemEvent::Reply`] on the event channel, keyed
/// by the call id carried in the RPC.
pub trait TLogTransport: Send {
    /// Dispatches one RPC.
    fn send(&mut self, rpc: OutboundRpc);
}

// ============================================================================
// Commands and Notifications
// ============================================================================

/// Operations the master can submit to the driver.
#[derive(Debug)]
pub enum DriverCommand {
    /// Replicate one commit.
    Push {
        prev_version: Version,
        version: Version,
        known_committed: Version,
        data: PushData,
        debug_id: Option<Uid>,
    },

    /// Advance the pop target for a tag.
    Pop { up_to: Version, tag: Tag },

    /// Confirm the epoch still accepts pushes.
    ConfirmEpochLive { debug_id: Option<Uid> },

    /// Stop the driver.
    Shutdown,
}

/// Inputs multiplexed onto the driver thread.
#[derive(Debug)]
pub enum DriverInput {
    /// A transport-delivered event.
    Event(LogSystemEvent),

    /// A master command.
    Command(DriverCommand),
}

/// Outputs the driver forwards to the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverNotification {
    /// A multi-RPC operation finished.
    Completion(Completion),

    /// A rejoin promise was decided.
    RejoinReply(RejoinToken, bool),
}

/// The master's side of a running driver.
#[derive(Debug)]
pub struct DriverHandle {
    /// Submit commands and transport events.
    pub input: Sender<DriverInput>,

    /// Receive completions and rejoin decisions.
    pub notifications: Receiver<DriverNotification>,
}

// ============================================================================
// Timer Queue
// ============================================================================

#[derive(Debug, Default)]
struct TimerQueue {
    armed: Vec<(Instant, TimerKind)>,
}

impl TimerQueue {
    fn arm(&mut self, deadline: Instant, kind: TimerKind) {
        self.armed.push((deadline, kind));
    }

    fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let position = self.armed.iter().position(|(deadline, _)| *deadline <= now)?;
        Some(self.armed.swap_remove(position).1)
    }

    fn until_next(&self, now: Instant) -> Option<Duration> {
        self.armed
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
            .min()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Runs one log system over a transport.
pub struct Driver<T: TLogTransport> {
    system: LogSystem,
    transport: T,
    input: Receiver<DriverInput>,
    notifications: Sender<DriverNotification>,
    timers: TimerQueue,
}

impl<T: TLogTransport> Driver<T> {
    /// Creates a driver and the handle the master keeps.
    pub fn new(system: LogSystem, transport: T) -> (Self, DriverHandle) {
        let (input_tx, input_rx) = channel();
        let (notify_tx, notify_rx) = channel();
        (
            Self {
                system,
                transport,
                input: input_rx,
                notifications: notify_tx,
                timers: TimerQueue::default(),
            },
            DriverHandle {
                input: input_tx,
                notifications: notify_rx,
            },
        )
    }

    /// Runs until shutdown or a system-level failure.
    ///
    /// Returns `Ok(())` on an orderly shutdown. A fatal action (the
    /// `on_error` contract) is returned as the error; dropping the handle
    /// without [`DriverCommand::Shutdown`] cancels the driver.
    pub fn run(mut self) -> Result<()> {
        loop {
            let now = Instant::now();
            while let Some(kind) = self.timers.pop_expired(now) {
                trace!(?kind, "timer fired");
                let actions = self.system.handle(LogSystemEvent::Timeout(kind));
                self.execute(actions)?;
            }

            let wait = self.timers.until_next(Instant::now()).unwrap_or(IDLE_POLL);
            match self.input.recv_timeout(wait) {
                Ok(DriverInput::Event(event)) => {
                    let actions = self.system.handle(event);
                    self.execute(actions)?;
                }
                Ok(DriverInput::Command(command)) => {
                    if !self.run_command(command)? {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(dbgid = %self.system.dbgid(), "driver input dropped");
                    return Err(LogError::Cancelled);
                }
            }
        }
    }

    fn run_command(&mut self, command: DriverCommand) -> Result<bool> {
        match command {
            DriverCommand::Push {
                prev_version,
                version,
                known_committed,
                data,
                debug_id,
            } => {
                let (_, actions) =
                    self.system
                        .push(prev_version, version, known_committed, &data, debug_id);
                self.execute(actions)?;
            }
            DriverCommand::Pop { up_to, tag } => {
                let actions = self.system.pop(up_to, tag);
                self.execute(actions)?;
            }
            DriverCommand::ConfirmEpochLive { debug_id } => {
                let (_, actions) = self.system.confirm_epoch_live(debug_id);
                self.execute(actions)?;
            }
            DriverCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn execute(&mut self, actions: Actions) -> Result<()> {
        let now = Instant::now();
        for rpc in actions.rpcs {
            if let Some(deadline) = rpc.deadline {
                self.timers.arm(now + deadline, TimerKind::CallDeadline(rpc.call));
            }
            self.transport.send(rpc);
        }
        for (kind, after) in actions.timers {
            self.timers.arm(now + after, kind);
        }
        for completion in actions.completions {
            let _ = self
                .notifications
                .send(DriverNotification::Completion(completion));
        }
        for (token, stop) in actions.rejoin_replies {
            let _ = self
                .notifications
                .send(DriverNotification::RejoinReply(token, stop));
        }
        match actions.fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
