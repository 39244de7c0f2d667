//! Per-server failure tracking.
//!
//! Each current-epoch handle gets a [`FailureMonitor`] feeding a
//! [`FailureFlag`]. An empty slot is failed by definition; a populated slot
//! follows the failure detector stream for the interface currently in it.
//! Replacing the interface re-arms the subscription, so failure is sticky
//! per subscription but re-evaluated on every handle change.

use taglog_types::Uid;
use tracing::debug;

use crate::handle::{FailureFlag, LogServerHandle};

// ============================================================================
// Failure Monitor
// ============================================================================

/// Tracks liveness of one log server slot.
#[derive(Debug)]
pub struct FailureMonitor {
    handle: LogServerHandle,
    flag: FailureFlag,
    watching: Option<Uid>,
    armed_generation: Option<u64>,
}

impl FailureMonitor {
    /// Creates a monitor over `handle` and arms it against the current
    /// contents.
    pub fn new(handle: LogServerHandle) -> Self {
        let mut monitor = Self {
            handle,
            flag: FailureFlag::new(),
            watching: None,
            armed_generation: None,
        };
        monitor.refresh();
        monitor
    }

    /// The observable this monitor feeds.
    pub fn flag(&self) -> FailureFlag {
        self.flag.clone()
    }

    /// Re-arms against the handle contents if they changed.
    ///
    /// Cheap when nothing changed; callers invoke this on every event.
    pub fn refresh(&mut self) {
        let generation = self.handle.generation();
        if self.armed_generation == Some(generation) {
            return;
        }
        self.armed_generation = Some(generation);

        let slot = self.handle.get();
        match slot.interf() {
            Some(interface) => {
                if self.watching != Some(interface.id) || self.flag.get() {
                    debug!(server = %interface.id, "failure monitor re-armed");
                }
                self.watching = Some(interface.id);
                // Fresh subscription: the detector has not fired for this
                // interface yet.
                self.flag.set(false);
            }
            None => {
                self.watching = None;
                self.flag.set(true);
            }
        }
    }

    /// Feeds one failure detector transition.
    ///
    /// Transitions for servers other than the one currently watched are
    /// stale and ignored.
    pub fn note_failure(&mut self, server: Uid, failed: bool) {
        if self.watching == Some(server) {
            self.flag.set(failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taglog_types::{LocalityData, NetworkAddress};

    use crate::message::{OptionalInterface, TLogInterface};

    fn interface(n: u64) -> TLogInterface {
        TLogInterface {
            id: Uid::from_u64(n),
            address: NetworkAddress::empty(),
            locality: LocalityData::new(),
        }
    }

    #[test]
    fn empty_slot_is_failed() {
        let handle = LogServerHandle::new(OptionalInterface::id_only(Uid::from_u64(1)));
        let monitor = FailureMonitor::new(handle);
        assert!(monitor.flag().get());
    }

    #[test]
    fn populated_slot_starts_unfailed() {
        let handle = LogServerHandle::new(OptionalInterface::known(interface(1)));
        let monitor = FailureMonitor::new(handle);
        assert!(!monitor.flag().get());
    }

    #[test]
    fn detector_transition_marks_failed() {
        let handle = LogServerHandle::new(OptionalInterface::known(interface(1)));
        let mut monitor = FailureMonitor::new(handle);

        monitor.note_failure(Uid::from_u64(1), true);
        assert!(monitor.flag().get());
    }

    #[test]
    fn stale_transitions_are_ignored() {
        let handle = LogServerHandle::new(OptionalInterface::known(interface(1)));
        let mut monitor = FailureMonitor::new(handle);

        monitor.note_failure(Uid::from_u64(9), true);
        assert!(!monitor.flag().get());
    }

    #[test]
    fn interface_replacement_resets_failure() {
        let handle = LogServerHandle::new(OptionalInterface::known(interface(1)));
        let mut monitor = FailureMonitor::new(handle.clone());

        monitor.note_failure(Uid::from_u64(1), true);
        assert!(monitor.flag().get());

        // The server rejoins with a fresh interface: new subscription.
        handle.set(OptionalInterface::known(interface(1)));
        monitor.refresh();
        assert!(!monitor.flag().get());
    }

    #[test]
    fn emptying_the_slot_fails_the_monitor() {
        let handle = LogServerHandle::new(OptionalInterface::known(interface(1)));
        let mut monitor = FailureMonitor::new(handle.clone());
        assert!(!monitor.flag().get());

        handle.set(OptionalInterface::id_only(Uid::from_u64(1)));
        monitor.refresh();
        assert!(monitor.flag().get());
    }
}
