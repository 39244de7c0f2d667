//! Replica placement policies.
//!
//! The coordinator treats the policy as an injected collaborator with three
//! entry points: augmenting a push set ([`ReplicationPolicy::select_replicas`]),
//! judging whether a server group spans enough failure domains
//! ([`ReplicationPolicy::validate`]), and the recovery-time combination sweep
//! ([`validate_all_combinations`]).
//!
//! Two stock policies ship with the crate: [`PolicyOne`] (any single server)
//! and [`PolicyAcross`] (a count of distinct locality values, each subgroup
//! satisfying an inner policy). Policies round-trip through the serializable
//! [`PolicyConfig`] for persistence in the core state.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use taglog_types::LocalityData;

use crate::locality::LocalitySet;

// ============================================================================
// Policy Trait
// ============================================================================

/// Replica placement evaluator.
pub trait ReplicationPolicy: Debug + Send + Sync {
    /// Short description for logging, e.g. `zoneid^2 x One`.
    fn name(&self) -> String;

    /// Chooses additional slot indices so that `already` plus the output
    /// satisfies the policy. Returns false if the set cannot be satisfied.
    fn select_replicas(&self, set: &LocalitySet, already: &[usize], out: &mut Vec<usize>) -> bool;

    /// Returns true if the group satisfies the policy on its own.
    fn validate(&self, group: &[LocalityData]) -> bool;

    /// Serializable description of this policy.
    fn config(&self) -> PolicyConfig;
}

// ============================================================================
// Policy Configuration (persisted form)
// ============================================================================

/// Serializable policy description, persisted in the core state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyConfig {
    /// Any single server.
    One,

    /// `count` distinct values of locality field `key`, each subgroup
    /// satisfying `inner`.
    Across {
        count: usize,
        key: String,
        inner: Box<PolicyConfig>,
    },
}

impl PolicyConfig {
    /// Convenience constructor for the common `Across(count, key, One)`.
    pub fn across(count: usize, key: impl Into<String>) -> Self {
        PolicyConfig::Across {
            count,
            key: key.into(),
            inner: Box::new(PolicyConfig::One),
        }
    }

    /// Builds the policy instance this configuration describes.
    pub fn build(&self) -> Arc<dyn ReplicationPolicy> {
        match self {
            PolicyConfig::One => Arc::new(PolicyOne),
            PolicyConfig::Across { count, key, inner } => Arc::new(PolicyAcross {
                count: *count,
                key: key.clone(),
                inner: inner.build(),
            }),
        }
    }
}

// ============================================================================
// PolicyOne
// ============================================================================

/// Satisfied by any single server.
#[derive(Debug, Clone, Copy)]
pub struct PolicyOne;

impl ReplicationPolicy for PolicyOne {
    fn name(&self) -> String {
        "One".to_string()
    }

    fn select_replicas(&self, set: &LocalitySet, already: &[usize], out: &mut Vec<usize>) -> bool {
        if !already.is_empty() {
            return true;
        }
        match set.entries().first() {
            Some((index, _)) => {
                out.push(*index);
                true
            }
            None => false,
        }
    }

    fn validate(&self, group: &[LocalityData]) -> bool {
        !group.is_empty()
    }

    fn config(&self) -> PolicyConfig {
        PolicyConfig::One
    }
}

// ============================================================================
// PolicyAcross
// ============================================================================

/// Requires `count` distinct values of one locality field.
///
/// A group validates when at least `count` distinct values of `key` appear,
/// each backed by a subgroup that satisfies `inner`. Servers with the field
/// unset never contribute a value.
#[derive(Debug, Clone)]
pub struct PolicyAcross {
    /// Distinct values required.
    pub count: usize,

    /// Locality field to count, e.g. `zoneid` or `data_hall`.
    pub key: String,

    /// Policy each value subgroup must satisfy.
    pub inner: Arc<dyn ReplicationPolicy>,
}

impl PolicyAcross {
    /// `count` distinct zones, one server each.
    pub fn zones(count: usize) -> Self {
        Self {
            count,
            key: taglog_types::locality_keys::ZONE_ID.to_string(),
            inner: Arc::new(PolicyOne),
        }
    }
}

impl ReplicationPolicy for PolicyAcross {
    fn name(&self) -> String {
        format!("{}^{} x {}", self.key, self.count, self.inner.name())
    }

    fn select_replicas(&self, set: &LocalitySet, already: &[usize], out: &mut Vec<usize>) -> bool {
        let mut covered: Vec<String> = Vec::new();
        for &index in already {
            let locality = set
                .locality_for(index)
                .expect("push location must be a live locality entry");
            if let Some(value) = locality.get(&self.key) {
                if !covered.iter().any(|v| v == value) {
                    covered.push(value.to_string());
                }
            }
        }

        for (index, locality) in set.entries() {
            if covered.len() >= self.count {
                break;
            }
            if already.contains(index) || out.contains(index) {
                continue;
            }
            let Some(value) = locality.get(&self.key) else {
                continue;
            };
            if covered.iter().any(|v| v == value) {
                continue;
            }
            covered.push(value.to_string());
            out.push(*index);
        }

        covered.len() >= self.count
    }

    fn validate(&self, group: &[LocalityData]) -> bool {
        let mut by_value: BTreeMap<&str, Vec<LocalityData>> = BTreeMap::new();
        for locality in group {
            if let Some(value) = locality.get(&self.key) {
                by_value.entry(value).or_default().push(locality.clone());
            }
        }
        by_value
            .values()
            .filter(|subgroup| self.inner.validate(subgroup))
            .count()
            >= self.count
    }

    fn config(&self) -> PolicyConfig {
        PolicyConfig::Across {
            count: self.count,
            key: self.key.clone(),
            inner: Box::new(self.inner.config()),
        }
    }
}

// ============================================================================
// Combination sweep
// ============================================================================

/// Advances `idx` to the next k-combination of `0..n`; false when exhausted.
fn next_combination(idx: &mut [usize], n: usize) -> bool {
    let k = idx.len();
    for i in (0..k).rev() {
        if idx[i] < n - k + i {
            idx[i] += 1;
            for j in i + 1..k {
                idx[j] = idx[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

/// Checks every `combination_size`-subset of `available` joined with
/// `unresponsive` against the policy.
///
/// With `check_if_valid = false` (the recovery sweep), the check fails, and
/// the offending combination is written to `bad_combo`, as soon as some
/// combination *does* validate: the unresponsive servers plus that many
/// possibly-skipped acknowledgers could then form a complete replica set
/// whose data is unrecoverable. With `check_if_valid = true` the polarity is
/// reversed.
pub fn validate_all_combinations(
    bad_combo: &mut Vec<LocalityData>,
    unresponsive: &[LocalityData],
    policy: &dyn ReplicationPolicy,
    available: &[LocalityData],
    combination_size: usize,
    check_if_valid: bool,
) -> bool {
    if available.len() < combination_size {
        return true;
    }

    let mut idx: Vec<usize> = (0..combination_size).collect();
    loop {
        let mut group: Vec<LocalityData> = unresponsive.to_vec();
        group.extend(idx.iter().map(|&i| available[i].clone()));

        if policy.validate(&group) != check_if_valid {
            bad_combo.clear();
            bad_combo.extend(idx.iter().map(|&i| available[i].clone()));
            return false;
        }

        if !next_combination(&mut idx, available.len()) {
            return true;
        }
    }
}
