//! Filesystem-free doubles for driving the compaction planner.
//!
//! The planner only sees the [`CompactableSegment`] / [`SegmentStore`]
//! capabilities, so planning scenarios are expressed against these stubs
//! instead of materialized segment files.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compaction::{CompactableSegment, SegmentStore};
use crate::config::{LogIndex, SegmentId};
use crate::segment::SegmentDescriptor;

/// In-memory stand-in for a segment's planner-visible state.
pub struct StubSegment {
    descriptor: SegmentDescriptor,
    last_index: LogIndex,
    length: u64,
    count: AtomicU64,
    clean_count: AtomicU64,
    full: bool,
}

impl StubSegment {
    /// A sealed segment; `is_compacted` follows from `version > 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn full(
        id: u64,
        version: u64,
        first_index: LogIndex,
        last_index: LogIndex,
        length: u64,
        count: u64,
        clean_count: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor: SegmentDescriptor::new(SegmentId::new(id), version, first_index),
            last_index,
            length,
            count: AtomicU64::new(count),
            clean_count: AtomicU64::new(clean_count),
            full: true,
        })
    }

    /// A segment still open for appends.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: u64,
        version: u64,
        first_index: LogIndex,
        last_index: LogIndex,
        length: u64,
        count: u64,
        clean_count: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor: SegmentDescriptor::new(SegmentId::new(id), version, first_index),
            last_index,
            length,
            count: AtomicU64::new(count),
            clean_count: AtomicU64::new(clean_count),
            full: false,
        })
    }

    /// Simulates the state machine cleaning additional entries.
    pub fn add_cleaned(&self, entries: u64) {
        self.clean_count.fetch_add(entries, Ordering::Relaxed);
    }
}

impl CompactableSegment for StubSegment {
    fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    fn first_index(&self) -> LogIndex {
        self.descriptor.index()
    }

    fn last_index(&self) -> LogIndex {
        self.last_index
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn clean_count(&self) -> u64 {
        self.clean_count.load(Ordering::Relaxed)
    }

    fn is_full(&self) -> bool {
        self.full
    }

    fn is_compacted(&self) -> bool {
        self.descriptor.version() > 1
    }
}

/// Fixed snapshot of segments plus a settable commit index.
pub struct StubStore {
    segments: Vec<Arc<StubSegment>>,
    commit_index: AtomicU64,
}

impl StubStore {
    pub fn new(segments: Vec<Arc<StubSegment>>, commit_index: LogIndex) -> Arc<Self> {
        Arc::new(Self {
            segments,
            commit_index: AtomicU64::new(commit_index),
        })
    }

    pub fn set_commit_index(&self, index: LogIndex) {
        self.commit_index.store(index, Ordering::Relaxed);
    }
}

impl SegmentStore for StubStore {
    type Segment = StubSegment;

    fn segments(&self) -> Vec<Arc<StubSegment>> {
        self.segments.clone()
    }

    fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::Relaxed)
    }
}
