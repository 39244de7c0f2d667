//! Shared observable cells.
//!
//! A [`LogServerHandle`] is the slot holding one server's
//! [`OptionalInterface`]; it is shared by value between the facade and
//! background machines and is never recycled across epochs. Change
//! notification is generation-based: every `set` bumps a counter, and
//! observers compare against the generation they last saw.

use std::sync::{Arc, Mutex};

use taglog_types::Uid;

use crate::message::OptionalInterface;

// ============================================================================
// Log Server Handle
// ============================================================================

#[derive(Debug)]
struct Slot {
    value: OptionalInterface,
    generation: u64,
}

/// Observable slot holding an optional log server interface.
///
/// Cloning shares the slot; the lifetime equals the longest holder.
#[derive(Debug, Clone)]
pub struct LogServerHandle {
    inner: Arc<Mutex<Slot>>,
}

impl LogServerHandle {
    /// Creates a new handle holding `value`.
    pub fn new(value: OptionalInterface) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                value,
                generation: 0,
            })),
        }
    }

    /// Snapshot of the current contents.
    pub fn get(&self) -> OptionalInterface {
        self.inner.lock().expect("handle lock poisoned").value.clone()
    }

    /// The server's stable identity.
    pub fn id(&self) -> Uid {
        self.inner.lock().expect("handle lock poisoned").value.id()
    }

    /// Returns true if a live interface is in the slot.
    pub fn present(&self) -> bool {
        self.inner
            .lock()
            .expect("handle lock poisoned")
            .value
            .present()
    }

    /// Replaces the contents, notifying all observers unconditionally.
    pub fn set(&self, value: OptionalInterface) {
        let mut slot = self.inner.lock().expect("handle lock poisoned");
        slot.value = value;
        slot.generation += 1;
    }

    /// Replaces the contents only when the endpoint actually differs: an
    /// empty slot, a new identity, or a new address. When it does replace,
    /// the notification is still unconditional (rejoin semantics).
    pub fn set_if_changed(&self, value: OptionalInterface) {
        let mut slot = self.inner.lock().expect("handle lock poisoned");
        let changed = !slot.value.present()
            || slot.value.id() != value.id()
            || slot.value.address() != value.address();
        if changed {
            slot.value = value;
            slot.generation += 1;
        }
    }

    /// Change counter; strictly increases on every `set`.
    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("handle lock poisoned").generation
    }
}

// ============================================================================
// Failure Flag
// ============================================================================

/// Observable boolean fed by a failure monitor.
///
/// Starts unfailed. Like the handle, notification is generation-based.
#[derive(Debug, Clone, Default)]
pub struct FailureFlag {
    inner: Arc<Mutex<(bool, u64)>>,
}

impl FailureFlag {
    /// Creates a new flag in the unfailed state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    pub fn get(&self) -> bool {
        self.inner.lock().expect("flag lock poisoned").0
    }

    /// Sets the value, notifying observers.
    pub fn set(&self, failed: bool) {
        let mut slot = self.inner.lock().expect("flag lock poisoned");
        slot.0 = failed;
        slot.1 += 1;
    }

    /// Change counter.
    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("flag lock poisoned").1
    }
}
