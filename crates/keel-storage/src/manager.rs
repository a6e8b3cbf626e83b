use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::{LogIndex, StorageConfig, SegmentId};
use crate::error::{StorageError, StorageResult};
use crate::fs::{Layout, SegmentFileName, fsync_dir, is_temp_segment_file, now_unix_millis};
use crate::segment::{SEGMENT_HEADER_SIZE, Segment, SegmentDescriptor};

fn header_is_blank(path: &std::path::Path) -> StorageResult<bool> {
    use std::io::Read;
    let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(buf.iter().all(|byte| *byte == 0)),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Directory index over the extant segments of one log instance.
///
/// Owns the base-index ordered map of segment handles, the commit index, and
/// all administrative mutation: rollover, compaction swaps, and truncation.
/// Administrative operations serialize behind the map's write lock; readers
/// take snapshots under the read guard and keep entries alive through `Arc`s.
pub struct SegmentManager {
    config: StorageConfig,
    layout: Layout,
    commit_index: AtomicU64,
    next_segment_id: AtomicU64,
    segments: RwLock<BTreeMap<LogIndex, Arc<Segment>>>,
}

impl SegmentManager {
    /// Opens the directory, discarding stale artifacts and recovering every
    /// surviving segment.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let layout = Layout::new(&config);
        layout.ensure()?;

        let manager = Self {
            config,
            layout,
            commit_index: AtomicU64::new(0),
            next_segment_id: AtomicU64::new(1),
            segments: RwLock::new(BTreeMap::new()),
        };
        manager.recover()?;
        Ok(manager)
    }

    fn recover(&self) -> StorageResult<()> {
        let mut by_id: HashMap<u64, Vec<(SegmentFileName, PathBuf)>> = HashMap::new();
        for entry in fs::read_dir(self.layout.segments_dir())? {
            let entry = entry?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if is_temp_segment_file(file_name) {
                warn!(path = %path.display(), "removing orphaned rewrite output");
                let _ = fs::remove_file(&path);
                continue;
            }
            match SegmentFileName::parse(file_name) {
                Some(name) => by_id.entry(name.id.as_u64()).or_default().push((name, path)),
                None => debug!(path = %path.display(), "ignoring foreign file"),
            }
        }

        let mut loaded: BTreeMap<LogIndex, Arc<Segment>> = BTreeMap::new();
        let mut max_id = 0u64;
        for (id, mut versions) in by_id {
            // Highest surviving version wins; everything below it is stale.
            versions.sort_by(|a, b| b.0.version.cmp(&a.0.version));
            let mut chosen: Option<Arc<Segment>> = None;
            let mut stale: Vec<PathBuf> = Vec::new();
            for (name, path) in versions {
                if chosen.is_some() {
                    stale.push(path);
                    continue;
                }
                match Segment::scan(&path) {
                    Ok(mut scan) => {
                        if scan.footer.is_none() && name.version > 1 {
                            warn!(
                                segment = id,
                                version = name.version,
                                "discarding incomplete rewrite"
                            );
                            stale.push(path);
                            continue;
                        }
                        let writable = scan.footer.is_none();
                        if writable && scan.truncated {
                            warn!(
                                segment = id,
                                logical_size = scan.logical_size,
                                "truncating torn tail segment"
                            );
                            Segment::truncate_torn(&path, &mut scan)?;
                        }
                        chosen = Some(Arc::new(Segment::open_recovered(&path, &scan, writable)?));
                    }
                    Err(err) if name.version > 1 => {
                        warn!(
                            segment = id,
                            version = name.version,
                            error = %err,
                            "discarding unreadable rewrite"
                        );
                        stale.push(path);
                    }
                    Err(err) => {
                        // A tail created right before a crash never had its
                        // header flushed; the file is still all zeros.
                        if header_is_blank(&path)? {
                            warn!(segment = id, "removing never-used tail segment file");
                            stale.push(path);
                        } else {
                            return Err(err);
                        }
                    }
                }
            }
            for path in stale {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "failed to remove stale segment file");
                }
            }
            let Some(segment) = chosen else { continue };
            max_id = max_id.max(id);
            let base = segment.first_index();
            if loaded.insert(base, segment).is_some() {
                return Err(StorageError::corrupt(format!(
                    "two segments claim base index {}",
                    base
                )));
            }
        }

        // Only the highest segment may stay open for appends; any other
        // unsealed survivor is a remnant of a crashed rollover.
        let tail_base = loaded.keys().next_back().copied();
        for (base, segment) in &loaded {
            if !segment.is_full() && Some(*base) != tail_base {
                warn!(
                    segment = segment.id().as_u64(),
                    base, "sealing non-tail segment left open by a crash"
                );
                segment.seal(now_unix_millis())?;
            }
        }

        self.next_segment_id.store(max_id + 1, Ordering::Release);
        let recovered = loaded.len();
        *self.segments.write() = loaded;
        if recovered > 0 {
            debug!(segments = recovered, "recovered segment directory");
        }
        Ok(())
    }

    /// Ordered snapshot of all extant segments, ascending by base index.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().values().cloned().collect()
    }

    /// Highest locally known Raft-committed index.
    #[inline]
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Advances the commit index; regressions are ignored.
    pub fn set_commit_index(&self, index: LogIndex) {
        let mut current = self.commit_index.load(Ordering::Acquire);
        while current < index {
            match self.commit_index.compare_exchange(
                current,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// First index covered by the log, 0 when empty.
    pub fn first_index(&self) -> LogIndex {
        self.segments
            .read()
            .values()
            .next()
            .map(|segment| segment.first_index())
            .unwrap_or(0)
    }

    /// Last index ever written, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.segments
            .read()
            .values()
            .next_back()
            .map(|segment| segment.last_index())
            .unwrap_or(0)
    }

    pub(crate) fn tail(&self) -> Option<Arc<Segment>> {
        self.segments.read().values().next_back().cloned()
    }

    /// Creates a fresh writable tail segment starting at `base`.
    pub(crate) fn create_tail(&self, base: LogIndex) -> StorageResult<Arc<Segment>> {
        let mut segments = self.segments.write();
        if let Some(last) = segments.values().next_back() {
            if base != last.last_index() + 1 {
                return Err(StorageError::invalid_state(format!(
                    "tail base {} does not extend last index {}",
                    base,
                    last.last_index()
                )));
            }
            if !last.is_full() {
                return Err(StorageError::invalid_state(
                    "previous tail must seal before rollover",
                ));
            }
        }

        let id = SegmentId::new(self.next_segment_id.fetch_add(1, Ordering::AcqRel));
        let descriptor = SegmentDescriptor::new(id, 1, base);
        let name = SegmentFileName::new(id, 1, base);
        let path = self.layout.segment_path(&name);
        let capacity = self.config.segment_capacity;
        let segment = Arc::new(Segment::create(
            descriptor,
            capacity,
            capacity,
            self.config.segment_max_bytes,
            now_unix_millis(),
            &path,
        )?);
        fsync_dir(self.layout.segments_dir())?;
        segments.insert(base, segment.clone());
        debug!(segment = id.as_u64(), base, "rolled over to new tail segment");
        Ok(segment)
    }

    /// Reads the payload at `index`; `None` is the tombstone/hole sentinel.
    pub fn get(&self, index: LogIndex) -> StorageResult<Option<Vec<u8>>> {
        let Some(segment) = self.segment_for(index) else {
            return Ok(None);
        };
        Ok(segment.get(index)?.map(<[u8]>::to_vec))
    }

    /// Tombstones `index`. Returns false when no live entry holds the index.
    pub fn clean(&self, index: LogIndex) -> bool {
        match self.segment_for(index) {
            Some(segment) => segment.clean(index),
            None => false,
        }
    }

    fn segment_for(&self, index: LogIndex) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .range(..=index)
            .next_back()
            .map(|(_, segment)| segment.clone())
    }

    /// Atomically swaps `group` for its rewritten replacement.
    ///
    /// Readers entering after the swap observe the replacement; readers still
    /// holding old `Arc`s keep valid data until they release them, at which
    /// point the unlinked files are reclaimed by the filesystem.
    pub(crate) fn replace_segments(
        &self,
        group: &[Arc<Segment>],
        replacement: Arc<Segment>,
    ) -> StorageResult<()> {
        let old_paths: Vec<PathBuf> = {
            let mut segments = self.segments.write();
            for member in group {
                let current = segments.get(&member.first_index());
                if !current.is_some_and(|segment| Arc::ptr_eq(segment, member)) {
                    return Err(StorageError::invalid_state(
                        "segment group changed during compaction",
                    ));
                }
            }
            let paths = group
                .iter()
                .map(|member| member.path().to_path_buf())
                .collect();
            for member in group {
                segments.remove(&member.first_index());
            }
            segments.insert(replacement.first_index(), replacement);
            paths
        };

        for path in old_paths {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to remove replaced segment file");
            }
        }
        fsync_dir(self.layout.segments_dir())?;
        Ok(())
    }

    /// Removes all entries above `index` for Raft conflict resolution.
    ///
    /// Whole segments above the cut are deleted; a boundary segment must be
    /// the unsealed tail. Sealed segments sit at or below the commit index,
    /// which Raft never truncates into.
    pub(crate) fn truncate(&self, index: LogIndex) -> StorageResult<()> {
        let removed_paths: Vec<PathBuf> = {
            let mut segments = self.segments.write();
            if let Some((_, boundary)) = segments.range(..=index).next_back() {
                if boundary.last_index() > index && boundary.is_full() {
                    return Err(StorageError::invalid_state(format!(
                        "cannot truncate to {} inside sealed segment {}",
                        index,
                        boundary.id()
                    )));
                }
            }
            let doomed: Vec<LogIndex> = segments
                .iter()
                .filter(|(_, segment)| segment.first_index() > index)
                .map(|(base, _)| *base)
                .collect();
            let mut paths = Vec::with_capacity(doomed.len());
            for base in doomed {
                if let Some(segment) = segments.remove(&base) {
                    paths.push(segment.path().to_path_buf());
                }
            }
            if let Some((_, boundary)) = segments.range(..=index).next_back() {
                if boundary.last_index() > index {
                    boundary.truncate_from(index)?;
                }
            }
            paths
        };

        for path in &removed_paths {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove truncated segment file");
            }
        }
        if !removed_paths.is_empty() {
            fsync_dir(self.layout.segments_dir())?;
        }
        Ok(())
    }

    /// Flushes the writable tail to disk.
    pub(crate) fn flush(&self) -> StorageResult<()> {
        if let Some(tail) = self.tail() {
            tail.flush_to_disk()?;
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            root_dir: dir.path().to_path_buf(),
            segment_capacity: 8,
            segment_max_bytes: 64 * 1024,
            ..StorageConfig::default()
        }
        .normalized()
    }

    #[test]
    fn commit_index_never_regresses() {
        let dir = TempDir::new().expect("tempdir");
        let manager = SegmentManager::open(test_config(&dir)).expect("open");
        manager.set_commit_index(10);
        manager.set_commit_index(4);
        assert_eq!(manager.commit_index(), 10);
    }

    #[test]
    fn rollover_requires_sealed_tail() {
        let dir = TempDir::new().expect("tempdir");
        let manager = SegmentManager::open(test_config(&dir)).expect("open");
        let tail = manager.create_tail(1).expect("tail");
        tail.append_entry(1, b"alpha").expect("append");
        assert!(matches!(
            manager.create_tail(2),
            Err(StorageError::InvalidState(_))
        ));
        tail.seal(0).expect("seal");
        manager.create_tail(2).expect("rollover");
        assert_eq!(manager.segments().len(), 2);
    }

    #[test]
    fn routes_reads_by_base_index() {
        let dir = TempDir::new().expect("tempdir");
        let manager = SegmentManager::open(test_config(&dir)).expect("open");
        let first = manager.create_tail(1).expect("tail");
        for index in 1..=8 {
            first.append_entry(index, b"first").expect("append");
        }
        first.seal(0).expect("seal");
        let second = manager.create_tail(9).expect("rollover");
        second.append_entry(9, b"second").expect("append");

        assert_eq!(manager.get(3).expect("get"), Some(b"first".to_vec()));
        assert_eq!(manager.get(9).expect("get"), Some(b"second".to_vec()));
        assert_eq!(manager.get(10).expect("get"), None);
        assert_eq!(manager.first_index(), 1);
        assert_eq!(manager.last_index(), 9);
    }

    #[test]
    fn recovery_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let config = test_config(&dir);
        {
            let manager = SegmentManager::open(config.clone()).expect("open");
            let tail = manager.create_tail(1).expect("tail");
            for index in 1..=8 {
                tail.append_entry(index, format!("entry-{index}").as_bytes())
                    .expect("append");
            }
            tail.seal(0).expect("seal");
            let next = manager.create_tail(9).expect("rollover");
            next.append_entry(9, b"tail-entry").expect("append");
            next.flush_to_disk().expect("flush");
        }

        let reopened = SegmentManager::open(config).expect("reopen");
        assert_eq!(reopened.segments().len(), 2);
        assert_eq!(reopened.get(5).expect("get"), Some(b"entry-5".to_vec()));
        assert_eq!(reopened.get(9).expect("get"), Some(b"tail-entry".to_vec()));
        // The recovered tail keeps accepting appends.
        let tail = reopened.tail().expect("tail");
        assert!(!tail.is_full());
        tail.append_entry(10, b"after-recovery").expect("append");
    }

    #[test]
    fn truncate_drops_segments_above_cut() {
        let dir = TempDir::new().expect("tempdir");
        let manager = SegmentManager::open(test_config(&dir)).expect("open");
        let first = manager.create_tail(1).expect("tail");
        for index in 1..=8 {
            first.append_entry(index, b"x").expect("append");
        }
        first.seal(0).expect("seal");
        let second = manager.create_tail(9).expect("rollover");
        for index in 9..=11 {
            second.append_entry(index, b"y").expect("append");
        }

        manager.truncate(9).expect("truncate");
        assert_eq!(manager.last_index(), 9);
        assert_eq!(manager.get(10).expect("get"), None);
        assert_eq!(manager.segments().len(), 2);

        assert!(matches!(
            manager.truncate(4),
            Err(StorageError::InvalidState(_))
        ));
    }
}
