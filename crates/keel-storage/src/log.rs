use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{FIRST_LOG_INDEX, LogIndex, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::fs::now_unix_millis;
use crate::manager::SegmentManager;
use crate::segment::{ENTRY_HEADER_SIZE, SEGMENT_FOOTER_SIZE, SEGMENT_HEADER_SIZE};

/// The replicated log: a totally ordered sequence of entries stored as an
/// append-only series of segments.
///
/// Entries are appended at the tail, tombstoned by the state machine through
/// [`Log::clean`], and reclaimed by minor compaction. Reads of a reclaimed
/// index return `None`; Raft consumers account for such holes below the
/// commit index.
pub struct Log {
    config: StorageConfig,
    manager: Arc<SegmentManager>,
    // Appends, rollover, and truncation are single-writer operations.
    append_lock: Mutex<()>,
}

impl Log {
    /// Opens or recovers the log rooted at `config.root_dir`.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let config = config.normalized();
        let manager = Arc::new(SegmentManager::open(config.clone())?);
        Ok(Self {
            config,
            manager,
            append_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Handle used to wire the compaction worker and planner.
    #[inline]
    pub fn manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }

    /// Appends an entry and returns its index.
    pub fn append(&self, payload: &[u8]) -> StorageResult<LogIndex> {
        // An entry that cannot fit even a fresh segment must be rejected up
        // front, not answered with an endless rollover.
        let available = self
            .config
            .segment_max_bytes
            .saturating_sub((SEGMENT_HEADER_SIZE + SEGMENT_FOOTER_SIZE) as u64);
        let needed = payload.len() as u64 + ENTRY_HEADER_SIZE as u64;
        if needed > available {
            return Err(StorageError::InsufficientSpace { needed, available });
        }

        let _guard = self.append_lock.lock();
        let index = match self.manager.last_index() {
            0 => FIRST_LOG_INDEX,
            last => last + 1,
        };

        let tail = match self.manager.tail() {
            Some(tail) if !tail.is_full() => tail,
            _ => self.manager.create_tail(index)?,
        };
        match tail.append_entry(index, payload) {
            Ok(()) => Ok(index),
            Err(StorageError::SegmentFull(id)) => {
                // The tail ran out of slots or bytes: seal it and roll over.
                tail.seal(now_unix_millis())?;
                debug!(segment = id.as_u64(), index, "sealed full tail segment");
                let next = self.manager.create_tail(index)?;
                next.append_entry(index, payload)?;
                Ok(index)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the entry at `index`.
    ///
    /// `None` marks a hole: either the index was never written, or its entry
    /// was cleaned and reclaimed by compaction.
    pub fn get(&self, index: LogIndex) -> StorageResult<Option<Vec<u8>>> {
        self.manager.get(index)
    }

    /// Tombstones the entry at `index` for future reclamation.
    ///
    /// Returns false when no live entry holds the index. Cleaning is an
    /// in-memory mark; the state machine re-drives it after a restart.
    pub fn clean(&self, index: LogIndex) -> StorageResult<bool> {
        Ok(self.manager.clean(index))
    }

    /// Advances the commit index. Regressions are ignored.
    pub fn commit(&self, index: LogIndex) {
        self.manager.set_commit_index(index);
    }

    #[inline]
    pub fn commit_index(&self) -> LogIndex {
        self.manager.commit_index()
    }

    /// First index covered by the log, 0 when empty.
    #[inline]
    pub fn first_index(&self) -> LogIndex {
        self.manager.first_index()
    }

    /// Last index ever written, 0 when empty.
    #[inline]
    pub fn last_index(&self) -> LogIndex {
        self.manager.last_index()
    }

    /// Number of indices covered by the log, holes included.
    pub fn len(&self) -> u64 {
        let first = self.manager.first_index();
        if first == 0 {
            return 0;
        }
        self.manager.last_index() - first + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the writable tail to disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.manager.flush()
    }

    /// Removes all entries above `index` for Raft conflict resolution.
    ///
    /// Serialized with appends; never reaches below the commit index in a
    /// correct Raft deployment.
    pub fn truncate(&self, index: LogIndex) -> StorageResult<()> {
        let _guard = self.append_lock.lock();
        self.manager.truncate(index)
    }
}
