//! Peek cursor composition.
//!
//! The cursor implementations themselves (merged quorum reader, single
//! server reader, epoch-stitching multi cursor) are external collaborators;
//! this module owns only which servers and version ranges are handed to
//! them. A [`PeekPlan`] is the fully resolved description of one peek.

use std::sync::Arc;

use taglog_types::{peek_quorum, LocalityData, Tag, Version};

use crate::handle::LogServerHandle;
use crate::log_system::{OldLogData, TLogSet};
use crate::policy::ReplicationPolicy;

// ============================================================================
// Cursor Specs
// ============================================================================

/// A quorum-merged read over one epoch's servers.
#[derive(Debug, Clone)]
pub struct MergedCursorSpec {
    /// Handles of the epoch's servers, in slot order.
    pub servers: Vec<LogServerHandle>,

    /// The tag's primary slot, preferred for reading.
    pub best_server: Option<usize>,

    /// Servers the merge must hear from: `n + 1 - replication_factor`.
    pub required: usize,

    /// The tag being read.
    pub tag: Tag,

    /// First version of the range.
    pub begin: Version,

    /// First version past the range.
    pub end: Version,

    /// Whether the cursor may prefetch batches in parallel.
    pub parallel_get_more: bool,

    /// Server localities, for policy-aware fallback.
    pub localities: Vec<LocalityData>,

    /// Replication policy of the epoch.
    pub policy: Arc<dyn ReplicationPolicy>,

    /// Replication factor of the epoch.
    pub replication_factor: usize,
}

/// A read pinned to a single server.
#[derive(Debug, Clone)]
pub struct SingleCursorSpec {
    /// The tag's primary server; absent when the epoch has no servers.
    pub server: Option<LogServerHandle>,

    /// The tag being read.
    pub tag: Tag,

    /// First version of the range.
    pub begin: Version,

    /// First version past the range.
    pub end: Version,
}

/// One segment of a multi-epoch plan.
#[derive(Debug, Clone)]
pub enum CursorSpec {
    /// Quorum-merged segment.
    Merged(MergedCursorSpec),

    /// Single-server segment.
    Single(SingleCursorSpec),
}

impl CursorSpec {
    /// First version of the segment.
    pub fn begin(&self) -> Version {
        match self {
            CursorSpec::Merged(spec) => spec.begin,
            CursorSpec::Single(spec) => spec.begin,
        }
    }

    /// First version past the segment.
    pub fn end(&self) -> Version {
        match self {
            CursorSpec::Merged(spec) => spec.end,
            CursorSpec::Single(spec) => spec.end,
        }
    }
}

/// Epoch-stitched plan: `segments[0]` is the current epoch, followed by old
/// epochs newest first. `epoch_ends[i]` is where segment `i + 1` hands over
/// to segment `i`.
#[derive(Debug, Clone)]
pub struct MultiCursorSpec {
    /// Segments, newest first.
    pub segments: Vec<CursorSpec>,

    /// Hand-over versions between consecutive segments.
    pub epoch_ends: Vec<Version>,
}

/// A fully resolved peek.
#[derive(Debug, Clone)]
pub enum PeekPlan {
    /// The request lies entirely within the current epoch.
    Merged(MergedCursorSpec),

    /// The request starts before the current epoch.
    Multi(MultiCursorSpec),

    /// Single-server read within the current epoch.
    Single(SingleCursorSpec),
}

// ============================================================================
// Composition
// ============================================================================

fn merged_spec(
    set: &TLogSet,
    tag: Tag,
    begin: Version,
    end: Version,
    parallel: bool,
) -> MergedCursorSpec {
    let n = set.handles.len();
    MergedCursorSpec {
        servers: set.handles.clone(),
        best_server: (n > 0).then(|| tag.as_usize() % n),
        required: if n > 0 {
            peek_quorum(n, set.replication_factor)
        } else {
            0
        },
        tag,
        begin,
        end,
        parallel_get_more: parallel,
        localities: set.localities.clone(),
        policy: set.policy.clone(),
        replication_factor: set.replication_factor,
    }
}

fn single_spec(set: &TLogSet, tag: Tag, begin: Version, end: Version) -> SingleCursorSpec {
    let n = set.handles.len();
    SingleCursorSpec {
        server: (n > 0).then(|| set.handles[tag.as_usize() % n].clone()),
        tag,
        begin,
        end,
    }
}

/// Appends one old-epoch segment per epoch still overlapping `begin`.
fn old_segments(
    old: &[OldLogData],
    tag: Tag,
    begin: Version,
    parallel: bool,
    segments: &mut Vec<CursorSpec>,
    epoch_ends: &mut Vec<Version>,
) {
    for (i, epoch) in old.iter().enumerate() {
        if begin >= epoch.epoch_end {
            break;
        }
        let segment_begin = match old.get(i + 1) {
            Some(older) => std::cmp::max(older.epoch_end, begin),
            None => begin,
        };
        segments.push(CursorSpec::Merged(merged_spec(
            &epoch.set,
            tag,
            segment_begin,
            epoch.epoch_end,
            parallel,
        )));
        epoch_ends.push(epoch.epoch_end);
    }
}

/// Plans a quorum-merged peek of `tag` from `begin`.
pub(crate) fn compose_peek(
    current: &TLogSet,
    old: &[OldLogData],
    peek_end: Version,
    begin: Version,
    tag: Tag,
    parallel: bool,
) -> PeekPlan {
    if old.is_empty() || begin >= old[0].epoch_end {
        return PeekPlan::Merged(merged_spec(current, tag, begin, peek_end, parallel));
    }

    let mut segments = vec![CursorSpec::Merged(merged_spec(
        current,
        tag,
        old[0].epoch_end,
        peek_end,
        parallel,
    ))];
    let mut epoch_ends = Vec::new();
    old_segments(old, tag, begin, parallel, &mut segments, &mut epoch_ends);
    PeekPlan::Multi(MultiCursorSpec {
        segments,
        epoch_ends,
    })
}

/// Plans a single-server peek of `tag` from `begin`.
///
/// Used when a non-copying recovery permits reading one server; old-epoch
/// segments still merge, only the current-epoch segment is pinned.
pub(crate) fn compose_peek_single(
    current: &TLogSet,
    old: &[OldLogData],
    peek_end: Version,
    begin: Version,
    tag: Tag,
) -> PeekPlan {
    if old.is_empty() || begin >= old[0].epoch_end {
        return PeekPlan::Single(single_spec(current, tag, begin, peek_end));
    }

    let mut segments = vec![CursorSpec::Single(single_spec(
        current,
        tag,
        old[0].epoch_end,
        peek_end,
    ))];
    let mut epoch_ends = Vec::new();
    old_segments(old, tag, begin, false, &mut segments, &mut epoch_ends);
    PeekPlan::Multi(MultiCursorSpec {
        segments,
        epoch_ends,
    })
}
