use std::fs;
use std::sync::Arc;

use tracing::debug;

use super::{CompactableSegment, SegmentStore};
use crate::config::LogIndex;
use crate::error::{StorageError, StorageResult};
use crate::fs::{SegmentFileName, TempFileGuard, fsync_dir, now_unix_millis};
use crate::manager::SegmentManager;
use crate::segment::{ENTRY_HEADER_SIZE, SEGMENT_FOOTER_SIZE, SEGMENT_HEADER_SIZE, Segment};

/// One planned rewrite: an ordered group of adjacent cleanable segments and
/// the store that owns them.
///
/// The descriptor itself is store-agnostic so planner tests can inspect
/// groups without a filesystem; execution is implemented against the
/// concrete [`SegmentManager`].
pub struct RewriteTask<S: SegmentStore> {
    store: Arc<S>,
    group: Vec<Arc<S::Segment>>,
}

impl<S: SegmentStore> RewriteTask<S> {
    pub(crate) fn new(store: Arc<S>, group: Vec<Arc<S::Segment>>) -> Self {
        Self { store, group }
    }

    /// Ordered group members, ascending by first index.
    #[inline]
    pub fn segments(&self) -> &[Arc<S::Segment>] {
        &self.group
    }

    /// Base index of the group, 0 for a (never planned) empty group.
    pub fn first_index(&self) -> LogIndex {
        self.group
            .first()
            .map(|segment| segment.first_index())
            .unwrap_or(0)
    }
}

impl RewriteTask<SegmentManager> {
    /// Rewrites the group into a single replacement segment.
    ///
    /// The replacement carries the first member's id at `version + 1`, the
    /// group's combined index span, and the largest contributing capacity
    /// tier. Live entries are copied in index order with their original
    /// indices; cleaned entries are omitted and read as tombstones
    /// afterwards. The output is staged under a temp name and renamed into
    /// place only after its footer is durable, so a crash at any point
    /// leaves either the old group or a complete replacement.
    pub fn execute(&self) -> StorageResult<Arc<Segment>> {
        let first = self
            .group
            .first()
            .ok_or_else(|| StorageError::invalid_state("empty rewrite group"))?;
        let last = self.group.last().expect("non-empty group");

        let descriptor = first.descriptor().next_version();
        let base = descriptor.index();
        let bound = last.last_index();
        let span = if bound < base {
            1
        } else {
            u32::try_from(bound - base + 1).map_err(|_| {
                StorageError::invalid_state(format!(
                    "rewrite span {} exceeds supported segment width",
                    bound - base + 1
                ))
            })?
        };
        let capacity = self
            .group
            .iter()
            .map(|segment| segment.length())
            .max()
            .unwrap_or(1)
            .max(1) as u32;

        let mut live_bytes = 0u64;
        for member in &self.group {
            live_bytes += member.live_entry_bytes()?;
        }
        let file_size = SEGMENT_HEADER_SIZE as u64
            + SEGMENT_FOOTER_SIZE as u64
            + live_bytes.max(ENTRY_HEADER_SIZE as u64);

        let layout = self.store.layout();
        let name = SegmentFileName::new(descriptor.id(), descriptor.version(), base);
        let temp_path = layout.temp_segment_path(&name);
        let final_path = layout.segment_path(&name);
        let guard = TempFileGuard::new(temp_path.clone());

        {
            let writer = Segment::create(
                descriptor,
                capacity,
                span,
                file_size,
                now_unix_millis(),
                &temp_path,
            )?;
            for member in &self.group {
                member.copy_live_into(&writer)?;
            }
            if bound >= base {
                writer.mark_bound(bound);
            }
            writer.seal(now_unix_millis())?;
        }

        fs::rename(&temp_path, &final_path)?;
        fsync_dir(layout.segments_dir())?;
        guard.disarm();

        // Reopen through the recovery path so the handle owns the final file
        // read-only, exactly as it would after a restart.
        let scan = Segment::scan(&final_path)?;
        let replacement = Arc::new(Segment::open_recovered(&final_path, &scan, false)?);

        // Tombstones that arrived while entries were being copied would be
        // lost with the old segments; carry them over before the swap.
        for member in &self.group {
            for index in member.cleaned_indices() {
                replacement.clean(index);
            }
        }

        if let Err(err) = self
            .store
            .replace_segments(&self.group, Arc::clone(&replacement))
        {
            let _ = fs::remove_file(&final_path);
            return Err(err);
        }

        debug!(
            segment = descriptor.id().as_u64(),
            version = descriptor.version(),
            merged = self.group.len(),
            live = replacement.count(),
            "rewrote segment group"
        );
        Ok(replacement)
    }
}
