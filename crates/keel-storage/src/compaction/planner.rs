use std::mem;
use std::sync::Arc;

use tracing::debug;

use super::{CompactableSegment, RewriteTask, SegmentStore};
use crate::config::{LogIndex, StorageConfig};

/// Plans one minor compaction pass.
///
/// The planner is stateless and performs no mutation: it folds the store's
/// segment snapshot into adjacent merge-groups of cleanable segments and
/// wraps each group in a [`RewriteTask`]. Segment selection is generational:
/// a version-1 segment must cross the full clean-ratio threshold, while each
/// survived rewrite divides the effective bar, so the planner favors segments
/// that keep accumulating cleaned entries across cycles.
pub struct MinorCompactionPlanner;

impl MinorCompactionPlanner {
    /// Builds rewrite tasks for the current pass, in ascending base-index
    /// order. An empty or fully retained store yields no tasks.
    pub fn build_tasks<S: SegmentStore>(
        config: &StorageConfig,
        store: &Arc<S>,
    ) -> Vec<RewriteTask<S>> {
        let groups = Self::cleanable_groups(config, store);
        if !groups.is_empty() {
            debug!(groups = groups.len(), "planned minor compaction pass");
        }
        groups
            .into_iter()
            .map(|group| RewriteTask::new(Arc::clone(store), group))
            .collect()
    }

    /// Folds the cleanable segment stream into adjacent merge-groups.
    ///
    /// Version and adjacency breaks are checked before the capacity test:
    /// two segments that would fit by size still must not merge across a
    /// version boundary or an index gap.
    fn cleanable_groups<S: SegmentStore>(
        config: &StorageConfig,
        store: &Arc<S>,
    ) -> Vec<Vec<Arc<S::Segment>>> {
        let mut groups: Vec<Vec<Arc<S::Segment>>> = Vec::new();
        let mut current: Vec<Arc<S::Segment>> = Vec::new();
        let mut previous: Option<Arc<S::Segment>> = None;

        for segment in Self::cleanable_segments(config, store) {
            if current.is_empty() {
                current.push(Arc::clone(&segment));
            } else if previous.as_ref().is_some_and(|prev| {
                prev.descriptor().version() != segment.descriptor().version()
                    || prev.last_index() + 1 != segment.first_index()
            }) {
                // Only direct neighbors sharing a version may combine.
                groups.push(mem::replace(&mut current, vec![Arc::clone(&segment)]));
            } else if group_live_count(&current) + segment.count() < group_capacity(&current) {
                current.push(Arc::clone(&segment));
            } else {
                // No room to combine: close the group and start over.
                groups.push(mem::replace(&mut current, vec![Arc::clone(&segment)]));
            }
            previous = Some(segment);
        }

        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    /// Filters the store snapshot down to segments worth rewriting now.
    fn cleanable_segments<S: SegmentStore>(
        config: &StorageConfig,
        store: &Arc<S>,
    ) -> Vec<Arc<S::Segment>> {
        let commit_index = store.commit_index();
        let threshold = config.compaction_threshold();
        store
            .segments()
            .into_iter()
            .filter(|segment| is_cleanable(threshold, commit_index, segment.as_ref()))
            .collect()
    }
}

/// Per-segment cleanability predicate.
fn is_cleanable<T>(threshold: f64, commit_index: LogIndex, segment: &T) -> bool
where
    T: CompactableSegment + ?Sized,
{
    // Never touch entries Raft has not committed yet; segments that already
    // survived a rewrite were vetted by an earlier pass.
    let eligible =
        segment.is_compacted() || (segment.is_full() && segment.last_index() <= commit_index);
    if !eligible {
        return false;
    }

    // Sparse fast path: a half-empty segment is worth merging regardless of
    // how little cleaning happened. This also covers count() == 0, keeping
    // the ratio below free of division by zero.
    let count = segment.count();
    if count < segment.length() / 2 {
        return true;
    }

    let clean_ratio = segment.clean_count() as f64 / count as f64;
    clean_ratio * segment.descriptor().version() as f64 >= threshold
}

fn group_live_count<T: CompactableSegment>(group: &[Arc<T>]) -> u64 {
    group.iter().map(|segment| segment.count()).sum()
}

fn group_capacity<T: CompactableSegment>(group: &[Arc<T>]) -> u64 {
    group
        .iter()
        .map(|segment| segment.length())
        .max()
        .unwrap_or(0)
}
