//! Minor compaction: the planner that selects and groups rewritable
//! segments, the rewrite task that replaces a group with a new-version
//! segment, and the background worker that drives both on a periodic tick.

mod planner;
mod task;
mod worker;

pub use planner::MinorCompactionPlanner;
pub use task::RewriteTask;
pub use worker::{CompactionMetrics, CompactionMetricsSnapshot, CompactionWorker};

use std::sync::Arc;

use crate::config::LogIndex;
use crate::manager::SegmentManager;
use crate::segment::{Segment, SegmentDescriptor};

/// Read-only view of a segment consumed by the compaction planner.
///
/// The planner depends only on these capabilities, so test doubles can drive
/// every planning scenario without touching a filesystem.
pub trait CompactableSegment: Send + Sync {
    fn descriptor(&self) -> SegmentDescriptor;

    /// First index covered, live or cleaned.
    fn first_index(&self) -> LogIndex;

    /// Last index ever written; preserved across rewrites.
    fn last_index(&self) -> LogIndex;

    /// Slot capacity tier.
    fn length(&self) -> u64;

    /// Physically present entries.
    fn count(&self) -> u64;

    /// Entries tombstoned but not yet reclaimed.
    fn clean_count(&self) -> u64;

    /// Sealed for appends.
    fn is_full(&self) -> bool;

    /// Already rewritten at least once.
    fn is_compacted(&self) -> bool;
}

/// The slice of the segment manager the planner consumes.
pub trait SegmentStore: Send + Sync {
    type Segment: CompactableSegment;

    /// Ordered snapshot of all extant segments, ascending by first index.
    fn segments(&self) -> Vec<Arc<Self::Segment>>;

    /// Highest locally known Raft-committed index.
    fn commit_index(&self) -> LogIndex;
}

impl CompactableSegment for Segment {
    #[inline]
    fn descriptor(&self) -> SegmentDescriptor {
        Segment::descriptor(self)
    }

    #[inline]
    fn first_index(&self) -> LogIndex {
        Segment::first_index(self)
    }

    #[inline]
    fn last_index(&self) -> LogIndex {
        Segment::last_index(self)
    }

    #[inline]
    fn length(&self) -> u64 {
        Segment::length(self)
    }

    #[inline]
    fn count(&self) -> u64 {
        Segment::count(self)
    }

    #[inline]
    fn clean_count(&self) -> u64 {
        Segment::clean_count(self)
    }

    #[inline]
    fn is_full(&self) -> bool {
        Segment::is_full(self)
    }

    #[inline]
    fn is_compacted(&self) -> bool {
        Segment::is_compacted(self)
    }
}

impl SegmentStore for SegmentManager {
    type Segment = Segment;

    #[inline]
    fn segments(&self) -> Vec<Arc<Segment>> {
        SegmentManager::segments(self)
    }

    #[inline]
    fn commit_index(&self) -> LogIndex {
        SegmentManager::commit_index(self)
    }
}
