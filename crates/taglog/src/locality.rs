//! Replica selection over the current epoch's server localities.
//!
//! A [`LocalitySet`] holds the placement metadata of the live slots in one
//! log server set and answers push routing questions: a tag's deterministic
//! primary location, and the policy-augmented full push set.

use taglog_types::{LocalityData, Tag};

use crate::message::{OptionalInterface, WorkerInterface};
use crate::policy::ReplicationPolicy;

// ============================================================================
// Locality Set
// ============================================================================

/// The live slots of one epoch's server set, with their localities.
///
/// `total_slots` counts every slot, present or not; primary locations are
/// computed over the full set so routing is stable across interface churn.
#[derive(Debug, Clone, Default)]
pub struct LocalitySet {
    entries: Vec<(usize, LocalityData)>,
    total_slots: usize,
}

impl LocalitySet {
    /// Builds a set from handle slot contents; absent slots carry no entry.
    pub fn from_interfaces(slots: &[OptionalInterface]) -> Self {
        let entries = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.interf()
                    .map(|interface| (index, interface.locality.clone()))
            })
            .collect();
        Self {
            entries,
            total_slots: slots.len(),
        }
    }

    /// Builds a set from recruitment candidates; every worker is an entry.
    pub fn from_workers(workers: &[WorkerInterface]) -> Self {
        let entries = workers
            .iter()
            .enumerate()
            .map(|(index, worker)| (index, worker.locality.clone()))
            .collect();
        Self {
            entries,
            total_slots: workers.len(),
        }
    }

    /// Builds a set where every slot is live, from bare localities.
    pub fn from_localities(localities: &[LocalityData]) -> Self {
        let entries = localities
            .iter()
            .enumerate()
            .map(|(index, locality)| (index, locality.clone()))
            .collect();
        Self {
            entries,
            total_slots: localities.len(),
        }
    }

    /// The live entries as `(slot index, locality)` pairs.
    pub fn entries(&self) -> &[(usize, LocalityData)] {
        &self.entries
    }

    /// Locality of one slot, if live.
    pub fn locality_for(&self, index: usize) -> Option<&LocalityData> {
        self.entries
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, locality)| locality)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no slot is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total slot count, present or not.
    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    /// Deterministic primary location for a tag: `tag % total_slots`.
    ///
    /// # Panics
    ///
    /// Panics if the set has no slots.
    pub fn best_location(&self, tag: Tag) -> usize {
        assert!(self.total_slots > 0, "best location over an empty set");
        tag.as_usize() % self.total_slots
    }

    /// The full push set for a commit carrying `tags`.
    ///
    /// The primaries of all tags, deduplicated in ascending order, then
    /// augmented by the policy with enough additional slots to satisfy it.
    ///
    /// # Panics
    ///
    /// Panics if the policy cannot be satisfied: recruitment guaranteed it
    /// could be, so this is an invariant violation rather than a runtime
    /// error.
    pub fn push_locations(&self, policy: &dyn ReplicationPolicy, tags: &[Tag]) -> Vec<usize> {
        let mut locations: Vec<usize> = tags.iter().map(|&tag| self.best_location(tag)).collect();
        uniquify(&mut locations);

        let mut extra = Vec::new();
        let satisfied = policy.select_replicas(self, &locations, &mut extra);
        assert!(
            satisfied,
            "replication policy {} cannot be satisfied for push",
            policy.name()
        );

        locations.extend(extra);
        locations
    }
}

/// Sorts ascending and removes duplicates, stabilizing policy input.
fn uniquify(values: &mut Vec<usize>) {
    values.sort_unstable();
    values.dedup();
}
