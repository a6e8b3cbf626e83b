use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crc64fast_nvme::Digest;
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;

use crate::config::{LogIndex, SegmentId};
use crate::error::{StorageError, StorageResult};
use crate::fs::create_fixed_size_file;

pub(crate) const SEGMENT_HEADER_SIZE: u32 = 64;
pub(crate) const SEGMENT_FOOTER_SIZE: u32 = 64;
pub(crate) const ENTRY_HEADER_SIZE: u32 = 16;
const SEGMENT_MAGIC: u32 = 0x4B53_4547; // "KSEG"
const SEGMENT_FORMAT_VERSION: u16 = 1;
const SEGMENT_FOOTER_MAGIC: u32 = 0x5345_4746; // "SEGF"

/// Identity of a logical segment, stable across compaction rewrites.
///
/// `id` and `index` never change for the lifetime of the logical segment;
/// `version` increments each time a rewrite replaces the physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    id: SegmentId,
    version: u64,
    index: LogIndex,
}

impl SegmentDescriptor {
    pub const fn new(id: SegmentId, version: u64, index: LogIndex) -> Self {
        Self { id, version, index }
    }

    #[inline]
    pub const fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Base (first intended) log index of the segment.
    #[inline]
    pub const fn index(&self) -> LogIndex {
        self.index
    }

    /// Descriptor of the replacement produced by a rewrite.
    pub const fn next_version(&self) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
            index: self.index,
        }
    }
}

pub(crate) struct SegmentHeader {
    pub(crate) id: SegmentId,
    pub(crate) version: u64,
    pub(crate) base_index: LogIndex,
    pub(crate) capacity: u32,
    pub(crate) span: u32,
    pub(crate) max_size: u32,
    pub(crate) created_at: i64,
}

impl SegmentHeader {
    fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SEGMENT_HEADER_SIZE as usize);
        buf.fill(0);
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(SEGMENT_HEADER_SIZE as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.as_u64().to_le_bytes());
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.base_index.to_le_bytes());
        buf[32..36].copy_from_slice(&self.capacity.to_le_bytes());
        buf[36..40].copy_from_slice(&self.span.to_le_bytes());
        buf[40..44].copy_from_slice(&self.max_size.to_le_bytes());
        buf[44..52].copy_from_slice(&self.created_at.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE as usize {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != SEGMENT_MAGIC {
            return None;
        }
        let format = u16::from_le_bytes(buf[4..6].try_into().ok()?);
        if format != SEGMENT_FORMAT_VERSION {
            return None;
        }
        let header_len = u16::from_le_bytes(buf[6..8].try_into().ok()?);
        if header_len as u32 != SEGMENT_HEADER_SIZE {
            return None;
        }
        Some(SegmentHeader {
            id: SegmentId::new(u64::from_le_bytes(buf[8..16].try_into().ok()?)),
            version: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            base_index: u64::from_le_bytes(buf[24..32].try_into().ok()?),
            capacity: u32::from_le_bytes(buf[32..36].try_into().ok()?),
            span: u32::from_le_bytes(buf[36..40].try_into().ok()?),
            max_size: u32::from_le_bytes(buf[40..44].try_into().ok()?),
            created_at: i64::from_le_bytes(buf[44..52].try_into().ok()?),
        })
    }

    pub(crate) fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor::new(self.id, self.version, self.base_index)
    }
}

/// Trailer written by `seal`; its presence marks a segment file complete.
#[derive(Debug, Clone, Copy)]
pub struct SegmentFooter {
    pub id: SegmentId,
    pub version: u64,
    pub count: u64,
    pub last_index: LogIndex,
    pub logical_size: u32,
    pub checksum: u32,
    pub sealed_at: i64,
}

impl SegmentFooter {
    fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SEGMENT_FOOTER_SIZE as usize);
        buf.fill(0);
        buf[0..4].copy_from_slice(&SEGMENT_FOOTER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&(SEGMENT_FORMAT_VERSION as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.as_u64().to_le_bytes());
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_index.to_le_bytes());
        buf[40..44].copy_from_slice(&self.logical_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.checksum.to_le_bytes());
        buf[48..56].copy_from_slice(&self.sealed_at.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SEGMENT_FOOTER_SIZE as usize {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != SEGMENT_FOOTER_MAGIC {
            return None;
        }
        let format = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        if format != SEGMENT_FORMAT_VERSION as u32 {
            return None;
        }
        Some(SegmentFooter {
            id: SegmentId::new(u64::from_le_bytes(buf[8..16].try_into().ok()?)),
            version: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            count: u64::from_le_bytes(buf[24..32].try_into().ok()?),
            last_index: u64::from_le_bytes(buf[32..40].try_into().ok()?),
            logical_size: u32::from_le_bytes(buf[40..44].try_into().ok()?),
            checksum: u32::from_le_bytes(buf[44..48].try_into().ok()?),
            sealed_at: i64::from_le_bytes(buf[48..56].try_into().ok()?),
        })
    }
}

/// Result of a read-only integrity pass over a segment file.
pub(crate) struct SegmentScan {
    pub(crate) header: SegmentHeader,
    pub(crate) footer: Option<SegmentFooter>,
    pub(crate) record_count: u64,
    pub(crate) last_index: LogIndex,
    pub(crate) logical_size: u32,
    pub(crate) truncated: bool,
}

/// A materialized segment of the replicated log.
///
/// Entries are addressed by slot (`index - descriptor.index()`); a zero slot
/// offset marks a hole, which readers observe as a tombstone sentinel. Active
/// segments are dense; rewritten segments are sparse wherever cleaned entries
/// were omitted. Appends are serialized by the owning log, reads are
/// lock-free.
pub struct Segment {
    descriptor: SegmentDescriptor,
    capacity: u32,
    span: u32,
    max_size: u32,
    created_at: i64,

    header_written: AtomicBool,
    sealed: AtomicBool,
    size: AtomicU32,
    count: AtomicU32,
    clean_count: AtomicU32,
    last_index: AtomicU64,

    slots: Box<[AtomicU32]>,
    cleaned: Box<[AtomicU64]>,
    data: SegmentData,
}

impl Segment {
    /// Creates a fresh segment file.
    ///
    /// `span` equals `capacity` for writer-created segments; rewrite tasks
    /// pass the combined index span of the group they replace.
    pub fn create(
        descriptor: SegmentDescriptor,
        capacity: u32,
        span: u32,
        max_bytes: u64,
        created_at: i64,
        path: &Path,
    ) -> StorageResult<Self> {
        if max_bytes > u32::MAX as u64 {
            return Err(StorageError::invalid_config(
                "segment_max_bytes exceeds u32::MAX for this build",
            ));
        }
        let max_size = max_bytes as u32;
        if max_size <= SEGMENT_HEADER_SIZE + SEGMENT_FOOTER_SIZE {
            return Err(StorageError::invalid_config(
                "segment_max_bytes must exceed reserved header and footer",
            ));
        }
        if capacity == 0 || span == 0 {
            return Err(StorageError::invalid_config(
                "segment capacity and span must be positive",
            ));
        }

        let data = SegmentData::create(path, max_size)?;
        Ok(Self::from_parts(
            descriptor, capacity, span, max_size, created_at, data, false, false,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        descriptor: SegmentDescriptor,
        capacity: u32,
        span: u32,
        max_size: u32,
        created_at: i64,
        data: SegmentData,
        header_written: bool,
        sealed: bool,
    ) -> Self {
        let slots = (0..span)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let words = (span as usize).div_ceil(64);
        let cleaned = (0..words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            descriptor,
            capacity,
            span,
            max_size,
            created_at,
            header_written: AtomicBool::new(header_written),
            sealed: AtomicBool::new(sealed),
            size: AtomicU32::new(if header_written { SEGMENT_HEADER_SIZE } else { 0 }),
            count: AtomicU32::new(0),
            clean_count: AtomicU32::new(0),
            last_index: AtomicU64::new(0),
            slots,
            cleaned,
            data,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    #[inline]
    pub fn id(&self) -> SegmentId {
        self.descriptor.id()
    }

    /// First index covered by this segment, live or cleaned.
    #[inline]
    pub fn first_index(&self) -> LogIndex {
        self.descriptor.index()
    }

    /// Last index ever written to this segment.
    ///
    /// Preserved across rewrites even when the trailing entries were omitted;
    /// an empty segment reports `first_index() - 1`.
    #[inline]
    pub fn last_index(&self) -> LogIndex {
        let bound = self.last_index.load(Ordering::Acquire);
        if bound == 0 {
            self.descriptor.index().saturating_sub(1)
        } else {
            bound
        }
    }

    /// Slot capacity tier of this segment.
    #[inline]
    pub fn length(&self) -> u64 {
        self.capacity as u64
    }

    /// Number of physically present entries.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire) as u64
    }

    /// Entries marked cleaned but not yet physically removed.
    #[inline]
    pub fn clean_count(&self) -> u64 {
        self.clean_count.load(Ordering::Acquire) as u64
    }

    /// Sealed for appends, either by reaching capacity or by a forced
    /// rollover.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// True once this logical segment has been rewritten by compaction.
    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.descriptor.version() > 1
    }

    #[inline]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.data.path()
    }

    /// Logical byte size, header included once the first entry lands.
    #[inline]
    pub fn current_size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    fn usable_limit(&self) -> u32 {
        self.max_size - SEGMENT_FOOTER_SIZE
    }

    #[inline]
    fn footer_offset(&self) -> u32 {
        self.max_size - SEGMENT_FOOTER_SIZE
    }

    fn slot_of(&self, index: LogIndex) -> Option<usize> {
        let slot = index.checked_sub(self.descriptor.index())?;
        if slot >= self.span as u64 {
            return None;
        }
        Some(slot as usize)
    }

    /// Appends `payload` at `index`.
    ///
    /// Indices must arrive in strictly ascending order; the owning log
    /// serializes writers. `SegmentFull` signals the caller to seal and roll
    /// over, either because the slot span is exhausted or because the byte
    /// budget ran out first.
    pub fn append_entry(&self, index: LogIndex, payload: &[u8]) -> StorageResult<()> {
        if self.is_full() {
            return Err(StorageError::invalid_state(
                "cannot append to sealed segment",
            ));
        }
        let Some(slot) = self.slot_of(index) else {
            if index < self.descriptor.index() {
                return Err(StorageError::invalid_state(format!(
                    "append index {} precedes segment base {}",
                    index,
                    self.descriptor.index()
                )));
            }
            return Err(StorageError::SegmentFull(self.id()));
        };
        let bound = self.last_index.load(Ordering::Acquire);
        if bound != 0 && index <= bound {
            return Err(StorageError::invalid_state(format!(
                "out-of-order append: index {} after {}",
                index, bound
            )));
        }

        self.ensure_header_written()?;

        let entry_len = ENTRY_HEADER_SIZE + payload.len() as u32;
        let offset = self.size.load(Ordering::Acquire);
        let next_size = offset
            .checked_add(entry_len)
            .ok_or_else(|| StorageError::SegmentFull(self.id()))?;
        if next_size > self.usable_limit() {
            return Err(StorageError::SegmentFull(self.id()));
        }

        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let mut digest = Digest::new();
        digest.write(payload);
        header[4..8].copy_from_slice(&fold_crc64(digest.sum64()).to_le_bytes());
        header[8..16].copy_from_slice(&index.to_le_bytes());

        self.data.write_bytes(offset as usize, &header)?;
        self.data
            .write_bytes(offset as usize + ENTRY_HEADER_SIZE as usize, payload)?;

        self.slots[slot].store(offset, Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
        self.size.store(next_size, Ordering::Release);
        store_max(&self.last_index, index);
        Ok(())
    }

    /// Reads the payload at `index`.
    ///
    /// `None` is the tombstone sentinel: the index falls inside this
    /// segment's bounds but its entry was omitted by a rewrite (or never
    /// written).
    pub fn get(&self, index: LogIndex) -> StorageResult<Option<&[u8]>> {
        let Some(slot) = self.slot_of(index) else {
            return Ok(None);
        };
        let offset = self.slots[slot].load(Ordering::Acquire);
        if offset == 0 {
            return Ok(None);
        }

        let header = self
            .data
            .read_slice(offset as usize..(offset + ENTRY_HEADER_SIZE) as usize)?;
        let length = u32::from_le_bytes(
            header[0..4]
                .try_into()
                .map_err(|_| StorageError::corrupt("entry length corrupt"))?,
        );
        let stored_index = u64::from_le_bytes(
            header[8..16]
                .try_into()
                .map_err(|_| StorageError::corrupt("entry index corrupt"))?,
        );
        if stored_index != index {
            return Err(StorageError::corrupt(format!(
                "slot for index {} holds entry {}",
                index, stored_index
            )));
        }

        let start = (offset + ENTRY_HEADER_SIZE) as usize;
        let payload = self.data.read_slice(start..start + length as usize)?;
        Ok(Some(payload))
    }

    /// Marks `index` cleaned. Returns false when the entry is absent or was
    /// already cleaned.
    pub fn clean(&self, index: LogIndex) -> bool {
        let Some(slot) = self.slot_of(index) else {
            return false;
        };
        if self.slots[slot].load(Ordering::Acquire) == 0 {
            return false;
        }
        let mask = 1u64 << (slot % 64);
        let previous = self.cleaned[slot / 64].fetch_or(mask, Ordering::AcqRel);
        if previous & mask == 0 {
            self.clean_count.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// True when `index` is present and tombstoned.
    pub fn is_cleaned(&self, index: LogIndex) -> bool {
        match self.slot_of(index) {
            Some(slot) => {
                self.slots[slot].load(Ordering::Acquire) != 0
                    && self.cleaned[slot / 64].load(Ordering::Acquire) & (1u64 << (slot % 64)) != 0
            }
            None => false,
        }
    }

    /// Indices currently tombstoned, in ascending order.
    pub(crate) fn cleaned_indices(&self) -> Vec<LogIndex> {
        let base = self.descriptor.index();
        (0..self.span as usize)
            .filter(|slot| {
                self.cleaned[slot / 64].load(Ordering::Acquire) & (1u64 << (slot % 64)) != 0
            })
            .map(|slot| base + slot as u64)
            .collect()
    }

    /// Bytes a rewrite target must reserve for this segment's live entries.
    pub(crate) fn live_entry_bytes(&self) -> StorageResult<u64> {
        let mut total = 0u64;
        self.for_each_live(|_, payload| {
            total += ENTRY_HEADER_SIZE as u64 + payload.len() as u64;
            Ok(())
        })?;
        Ok(total)
    }

    /// Copies every live (present, non-cleaned) entry into `target`,
    /// preserving indices. Returns the number of entries copied.
    pub(crate) fn copy_live_into(&self, target: &Segment) -> StorageResult<u64> {
        let mut copied = 0u64;
        self.for_each_live(|index, payload| {
            target.append_entry(index, payload)?;
            copied += 1;
            Ok(())
        })?;
        Ok(copied)
    }

    fn for_each_live(
        &self,
        mut visit: impl FnMut(LogIndex, &[u8]) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let base = self.descriptor.index();
        for slot in 0..self.span as usize {
            let offset = self.slots[slot].load(Ordering::Acquire);
            if offset == 0 {
                continue;
            }
            if self.cleaned[slot / 64].load(Ordering::Acquire) & (1u64 << (slot % 64)) != 0 {
                continue;
            }
            let index = base + slot as u64;
            let payload = self.get(index)?.ok_or_else(|| {
                StorageError::corrupt(format!("slot for index {} vanished during copy", index))
            })?;
            visit(index, payload)?;
        }
        Ok(())
    }

    /// Extends the index bound without writing an entry.
    ///
    /// Rewrite tasks call this so a replacement whose trailing entries were
    /// all cleaned still reports the original `last_index`.
    pub(crate) fn mark_bound(&self, index: LogIndex) {
        store_max(&self.last_index, index);
    }

    /// Seals the segment: writes the footer, syncs, and flips it read-only.
    pub fn seal(&self, sealed_at: i64) -> StorageResult<SegmentFooter> {
        if self
            .sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StorageError::invalid_state("segment already sealed"));
        }

        let result = (|| -> StorageResult<SegmentFooter> {
            self.ensure_header_written()?;

            let footer = SegmentFooter {
                id: self.descriptor.id(),
                version: self.descriptor.version(),
                count: self.count(),
                last_index: self.last_index.load(Ordering::Acquire),
                logical_size: self.size.load(Ordering::Acquire),
                checksum: self.compute_payload_checksum()?,
                sealed_at,
            };

            let mut buf = [0u8; SEGMENT_FOOTER_SIZE as usize];
            footer.encode(&mut buf);
            self.data.write_bytes(self.footer_offset() as usize, &buf)?;
            self.data.flush_and_sync()?;
            self.data.mark_read_only();
            Ok(footer)
        })();

        if result.is_err() {
            self.sealed.store(false, Ordering::Release);
        }
        result
    }

    /// Drops all entries above `index` from an unsealed tail segment.
    ///
    /// The byte region above the cut is zeroed so a later recovery scan stops
    /// at the truncation point instead of resurrecting removed entries.
    /// Returns the number of entries removed.
    pub(crate) fn truncate_from(&self, index: LogIndex) -> StorageResult<u64> {
        if self.is_full() {
            return Err(StorageError::invalid_state(
                "cannot truncate a sealed segment",
            ));
        }
        if index >= self.last_index() {
            return Ok(0);
        }

        let base = self.descriptor.index();
        let first_removed_slot = if index < base {
            0
        } else {
            (index - base + 1) as usize
        };

        let mut removed = 0u64;
        let mut cut_offset: Option<u32> = None;
        for slot in first_removed_slot..self.span as usize {
            let offset = self.slots[slot].swap(0, Ordering::AcqRel);
            if offset == 0 {
                continue;
            }
            removed += 1;
            if cut_offset.is_none_or(|current| offset < current) {
                cut_offset = Some(offset);
            }
            let mask = 1u64 << (slot % 64);
            if self.cleaned[slot / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0 {
                self.clean_count.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if let Some(cut) = cut_offset {
            let old_size = self.size.load(Ordering::Acquire);
            self.data.zero_range(cut as usize..old_size as usize)?;
            self.data.flush_and_sync()?;
            self.size.store(cut, Ordering::Release);
            self.count.fetch_sub(removed as u32, Ordering::AcqRel);
            let new_bound = if index < base { 0 } else { index };
            self.last_index.store(new_bound, Ordering::Release);
        }
        Ok(removed)
    }

    /// Flushes outstanding mmap writes to disk.
    pub fn flush_to_disk(&self) -> StorageResult<()> {
        self.data.flush_and_sync()
    }

    fn compute_payload_checksum(&self) -> StorageResult<u32> {
        let mut digest = Digest::new();
        let mut any = false;
        for slot in 0..self.span as usize {
            let offset = self.slots[slot].load(Ordering::Acquire);
            if offset == 0 {
                continue;
            }
            let header = self
                .data
                .read_slice(offset as usize..(offset + ENTRY_HEADER_SIZE) as usize)?;
            let length = u32::from_le_bytes(
                header[0..4]
                    .try_into()
                    .map_err(|_| StorageError::corrupt("entry length corrupt"))?,
            ) as usize;
            let start = (offset + ENTRY_HEADER_SIZE) as usize;
            let payload = self.data.read_slice(start..start + length)?;
            digest.write(payload);
            any = true;
        }
        Ok(if any { fold_crc64(digest.sum64()) } else { 0 })
    }

    fn ensure_header_written(&self) -> StorageResult<()> {
        if self.header_written.load(Ordering::Acquire) {
            return Ok(());
        }
        if self
            .header_written
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let header = SegmentHeader {
            id: self.descriptor.id(),
            version: self.descriptor.version(),
            base_index: self.descriptor.index(),
            capacity: self.capacity,
            span: self.span,
            max_size: self.max_size,
            created_at: self.created_at,
        };
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        header.encode(&mut buf);
        self.data.write_bytes(0, &buf)?;
        self.size.store(SEGMENT_HEADER_SIZE, Ordering::Release);
        Ok(())
    }

    /// Integrity pass over a segment file without materializing it.
    ///
    /// A decodable footer whose record count and checksum match the walked
    /// records marks the file sealed; anything else is reported as an
    /// unsealed (possibly torn) segment.
    pub(crate) fn scan(path: &Path) -> StorageResult<SegmentScan> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < SEGMENT_HEADER_SIZE as usize {
            return Err(StorageError::corrupt(format!(
                "segment {} too small for header",
                path.display()
            )));
        }
        let header = SegmentHeader::decode(&mmap[..SEGMENT_HEADER_SIZE as usize]).ok_or_else(
            || StorageError::corrupt(format!("segment {} has invalid header", path.display())),
        )?;
        if mmap.len() < header.max_size as usize {
            return Err(StorageError::corrupt(format!(
                "segment {} truncated: expected {} bytes, found {}",
                path.display(),
                header.max_size,
                mmap.len()
            )));
        }

        let usable_limit = (header.max_size - SEGMENT_FOOTER_SIZE) as usize;
        let footer_offset = usable_limit;
        let footer_candidate =
            SegmentFooter::decode(&mmap[footer_offset..footer_offset + SEGMENT_FOOTER_SIZE as usize])
                .filter(|footer| {
                    footer.id == header.id
                        && footer.version == header.version
                        && footer.logical_size as usize <= usable_limit
                });

        let mut truncated = false;
        let mut footer = None;
        let walk = if let Some(candidate) = footer_candidate {
            let attempt = walk_records(&mmap, &header, candidate.logical_size as usize)?;
            if !attempt.truncated
                && attempt.record_count == candidate.count
                && attempt.checksum == candidate.checksum
            {
                footer = Some(candidate);
                attempt
            } else {
                truncated = true;
                walk_records(&mmap, &header, usable_limit)?
            }
        } else {
            walk_records(&mmap, &header, usable_limit)?
        };

        let last_index = footer.map(|f| f.last_index).unwrap_or(walk.last_index);
        Ok(SegmentScan {
            header,
            footer,
            record_count: walk.record_count,
            last_index,
            logical_size: walk.consumed as u32,
            truncated: truncated || walk.truncated,
        })
    }

    /// Materializes a previously scanned segment file.
    pub(crate) fn open_recovered(
        path: &Path,
        scan: &SegmentScan,
        writable: bool,
    ) -> StorageResult<Self> {
        let header = &scan.header;
        let data = SegmentData::open(path, header.max_size, writable)?;
        let segment = Self::from_parts(
            header.descriptor(),
            header.capacity,
            header.span,
            header.max_size,
            header.created_at,
            data,
            true,
            !writable,
        );

        let mut cursor = SEGMENT_HEADER_SIZE as usize;
        let limit = scan.logical_size as usize;
        let mut count = 0u32;
        while cursor + ENTRY_HEADER_SIZE as usize <= limit {
            let record = segment
                .data
                .read_slice(cursor..cursor + ENTRY_HEADER_SIZE as usize)?;
            let length = u32::from_le_bytes(
                record[0..4]
                    .try_into()
                    .map_err(|_| StorageError::corrupt("entry length corrupt"))?,
            ) as usize;
            if length == 0 {
                break;
            }
            let index = u64::from_le_bytes(
                record[8..16]
                    .try_into()
                    .map_err(|_| StorageError::corrupt("entry index corrupt"))?,
            );
            let slot = segment.slot_of(index).ok_or_else(|| {
                StorageError::corrupt(format!(
                    "segment {} holds out-of-range index {}",
                    path.display(),
                    index
                ))
            })?;
            if segment.slots[slot].swap(cursor as u32, Ordering::AcqRel) == 0 {
                count += 1;
            }
            cursor += ENTRY_HEADER_SIZE as usize + length;
        }

        segment.count.store(count, Ordering::Release);
        segment
            .size
            .store(scan.logical_size.max(SEGMENT_HEADER_SIZE), Ordering::Release);
        segment.last_index.store(
            if scan.last_index >= header.base_index {
                scan.last_index
            } else {
                0
            },
            Ordering::Release,
        );
        Ok(segment)
    }

    /// Zeroes the torn tail of an unsealed segment file in place.
    pub(crate) fn truncate_torn(path: &Path, scan: &mut SegmentScan) -> StorageResult<()> {
        let logical = scan.logical_size as usize;
        let usable_limit = (scan.header.max_size - SEGMENT_FOOTER_SIZE) as usize;
        if logical > usable_limit {
            return Err(StorageError::corrupt(format!(
                "segment {} logical size {} exceeds usable limit {}",
                path.display(),
                logical,
                usable_limit
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if logical < usable_limit {
            mmap[logical..usable_limit].fill(0);
        }
        mmap[usable_limit..usable_limit + SEGMENT_FOOTER_SIZE as usize].fill(0);
        mmap.flush()?;

        scan.footer = None;
        scan.truncated = false;
        Ok(())
    }
}

struct WalkSummary {
    consumed: usize,
    record_count: u64,
    last_index: LogIndex,
    checksum: u32,
    truncated: bool,
}

fn walk_records(data: &[u8], header: &SegmentHeader, limit: usize) -> StorageResult<WalkSummary> {
    let ceiling = limit
        .min(data.len())
        .max(SEGMENT_HEADER_SIZE as usize);
    let max_payload =
        (header.max_size - SEGMENT_HEADER_SIZE - SEGMENT_FOOTER_SIZE) as usize;

    let mut cursor = SEGMENT_HEADER_SIZE as usize;
    let mut digest = Digest::new();
    let mut record_count = 0u64;
    let mut last_index = 0u64;
    let mut truncated = false;

    while cursor + ENTRY_HEADER_SIZE as usize <= ceiling {
        let record = &data[cursor..cursor + ENTRY_HEADER_SIZE as usize];
        let length = u32::from_le_bytes(
            record[0..4]
                .try_into()
                .map_err(|_| StorageError::corrupt("entry length slice corrupt"))?,
        ) as usize;
        if length == 0 {
            break;
        }
        let checksum = u32::from_le_bytes(
            record[4..8]
                .try_into()
                .map_err(|_| StorageError::corrupt("entry checksum slice corrupt"))?,
        );
        let index = u64::from_le_bytes(
            record[8..16]
                .try_into()
                .map_err(|_| StorageError::corrupt("entry index slice corrupt"))?,
        );

        let payload_start = cursor + ENTRY_HEADER_SIZE as usize;
        let payload_end = payload_start + length;
        if length > max_payload || payload_end > ceiling {
            truncated = true;
            break;
        }
        if index < header.base_index || index - header.base_index >= header.span as u64 {
            truncated = true;
            break;
        }

        let payload = &data[payload_start..payload_end];
        let mut record_digest = Digest::new();
        record_digest.write(payload);
        if fold_crc64(record_digest.sum64()) != checksum {
            truncated = true;
            break;
        }

        digest.write(payload);
        record_count += 1;
        last_index = last_index.max(index);
        cursor = payload_end;
    }

    Ok(WalkSummary {
        consumed: cursor,
        record_count,
        last_index,
        checksum: if record_count == 0 {
            0
        } else {
            fold_crc64(digest.sum64())
        },
        truncated,
    })
}

#[inline]
fn fold_crc64(value: u64) -> u32 {
    ((value >> 32) as u32) ^ (value as u32)
}

fn store_max(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Acquire);
    while current < value {
        match cell.compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

enum SegmentMmap {
    Read(Mmap),
    Write(MmapMut),
}

struct SegmentData {
    path: PathBuf,
    mmap: Mutex<SegmentMmap>,
    data: AtomicPtr<u8>,
    max_size: u32,
    writable: AtomicBool,
}

unsafe impl Send for SegmentData {}
unsafe impl Sync for SegmentData {}

impl SegmentData {
    fn create(path: &Path, max_size: u32) -> StorageResult<Self> {
        let file = create_fixed_size_file(path, max_size as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() != max_size as usize {
            return Err(StorageError::corrupt(format!(
                "segment {} mapped {} bytes, expected {}",
                path.display(),
                mmap.len(),
                max_size
            )));
        }
        let data_ptr = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(SegmentMmap::Write(mmap)),
            data: AtomicPtr::new(data_ptr),
            max_size,
            writable: AtomicBool::new(true),
        })
    }

    fn open(path: &Path, max_size: u32, writable: bool) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let (mmap, ptr) = if writable {
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            if map.len() < max_size as usize {
                return Err(StorageError::corrupt(format!(
                    "segment {} mapped {} bytes, expected {}",
                    path.display(),
                    map.len(),
                    max_size
                )));
            }
            let data_ptr = map.as_mut_ptr();
            (SegmentMmap::Write(map), data_ptr)
        } else {
            let map = unsafe { Mmap::map(&file)? };
            if map.len() < max_size as usize {
                return Err(StorageError::corrupt(format!(
                    "segment {} mapped {} bytes, expected {}",
                    path.display(),
                    map.len(),
                    max_size
                )));
            }
            let data_ptr = map.as_ptr() as *mut u8;
            (SegmentMmap::Read(map), data_ptr)
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(mmap),
            data: AtomicPtr::new(ptr),
            max_size,
            writable: AtomicBool::new(writable),
        })
    }

    #[inline]
    fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn mark_read_only(&self) {
        self.writable.store(false, Ordering::Release);
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        if offset + bytes.len() > self.max_size as usize {
            return Err(StorageError::invalid_state("segment write out of bounds"));
        }
        if !self.is_writable() {
            return Err(StorageError::invalid_state(
                "attempted to write to read-only segment",
            ));
        }
        let ptr = self.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(StorageError::invalid_state("segment memory unmapped"));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    fn zero_range(&self, range: Range<usize>) -> StorageResult<()> {
        if range.end > self.max_size as usize || range.start > range.end {
            return Err(StorageError::invalid_state("segment write out of bounds"));
        }
        if !self.is_writable() {
            return Err(StorageError::invalid_state(
                "attempted to write to read-only segment",
            ));
        }
        let ptr = self.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(StorageError::invalid_state("segment memory unmapped"));
        }
        unsafe {
            ptr::write_bytes(ptr.add(range.start), 0, range.len());
        }
        Ok(())
    }

    fn read_slice(&self, range: Range<usize>) -> StorageResult<&[u8]> {
        if range.end > self.max_size as usize || range.start > range.end {
            return Err(StorageError::invalid_state("segment read out of bounds"));
        }
        let ptr = self.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(StorageError::invalid_state("segment memory unmapped"));
        }
        unsafe { Ok(slice::from_raw_parts(ptr.add(range.start), range.len())) }
    }

    fn flush_and_sync(&self) -> StorageResult<()> {
        let guard = self.mmap.lock();
        match &*guard {
            SegmentMmap::Write(map) => map.flush()?,
            SegmentMmap::Read(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_segment(dir: &TempDir, base: LogIndex, capacity: u32) -> Segment {
        let descriptor = SegmentDescriptor::new(SegmentId::new(1), 1, base);
        Segment::create(
            descriptor,
            capacity,
            capacity,
            64 * 1024,
            0,
            &dir.path().join("segment.seg"),
        )
        .expect("create segment")
    }

    #[test]
    fn append_and_read_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let segment = test_segment(&dir, 1, 8);
        segment.append_entry(1, b"alpha").expect("append");
        segment.append_entry(2, b"beta").expect("append");

        assert_eq!(segment.get(1).expect("get"), Some(&b"alpha"[..]));
        assert_eq!(segment.get(2).expect("get"), Some(&b"beta"[..]));
        assert_eq!(segment.get(3).expect("get"), None);
        assert_eq!(segment.count(), 2);
        assert_eq!(segment.first_index(), 1);
        assert_eq!(segment.last_index(), 2);
    }

    #[test]
    fn rejects_out_of_order_appends() {
        let dir = TempDir::new().expect("tempdir");
        let segment = test_segment(&dir, 1, 8);
        segment.append_entry(1, b"alpha").expect("append");
        assert!(matches!(
            segment.append_entry(1, b"dup"),
            Err(StorageError::InvalidState(_))
        ));
    }

    #[test]
    fn slot_exhaustion_reports_full() {
        let dir = TempDir::new().expect("tempdir");
        let segment = test_segment(&dir, 1, 8);
        for index in 1..=8 {
            segment
                .append_entry(index, b"payload")
                .expect("append within capacity");
        }
        assert!(matches!(
            segment.append_entry(9, b"overflow"),
            Err(StorageError::SegmentFull(_))
        ));
    }

    #[test]
    fn clean_marks_and_counts() {
        let dir = TempDir::new().expect("tempdir");
        let segment = test_segment(&dir, 1, 8);
        segment.append_entry(1, b"alpha").expect("append");
        segment.append_entry(2, b"beta").expect("append");

        assert!(segment.clean(1));
        assert!(!segment.clean(1));
        assert!(!segment.clean(5));
        assert_eq!(segment.clean_count(), 1);
        assert!(segment.is_cleaned(1));
        assert!(!segment.is_cleaned(2));
        // Cleaned entries stay readable until a rewrite drops them.
        assert_eq!(segment.get(1).expect("get"), Some(&b"alpha"[..]));
    }

    #[test]
    fn empty_segment_bounds() {
        let dir = TempDir::new().expect("tempdir");
        let segment = test_segment(&dir, 100, 8);
        assert_eq!(segment.first_index(), 100);
        assert_eq!(segment.last_index(), 99);
    }

    #[test]
    fn seal_then_scan_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("segment.seg");
        let descriptor = SegmentDescriptor::new(SegmentId::new(3), 1, 10);
        let segment =
            Segment::create(descriptor, 8, 8, 64 * 1024, 7, &path).expect("create segment");
        for index in 10..=13 {
            segment.append_entry(index, b"payload").expect("append");
        }
        segment.seal(99).expect("seal");
        assert!(segment.is_full());
        assert!(matches!(
            segment.append_entry(14, b"late"),
            Err(StorageError::InvalidState(_))
        ));

        let scan = Segment::scan(&path).expect("scan");
        let footer = scan.footer.expect("footer present");
        assert_eq!(footer.count, 4);
        assert_eq!(footer.last_index, 13);
        assert!(!scan.truncated);

        let recovered = Segment::open_recovered(&path, &scan, false).expect("recover");
        assert_eq!(recovered.count(), 4);
        assert_eq!(recovered.last_index(), 13);
        assert!(recovered.is_full());
        assert_eq!(recovered.get(11).expect("get"), Some(&b"payload"[..]));
    }

    #[test]
    fn torn_tail_is_detected_and_truncated() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("segment.seg");
        let descriptor = SegmentDescriptor::new(SegmentId::new(5), 1, 1);
        let torn_offset;
        {
            let segment =
                Segment::create(descriptor, 8, 8, 64 * 1024, 0, &path).expect("create segment");
            for index in 1..=3 {
                segment.append_entry(index, b"durable").expect("append");
            }
            segment.flush_to_disk().expect("flush");
            torn_offset = segment.current_size() as u64;
        }

        // Simulate a crash mid-append: a record header whose checksum never
        // made it to disk intact.
        let mut file = OpenOptions::new().write(true).open(&path).expect("open");
        file.seek(SeekFrom::Start(torn_offset)).expect("seek");
        let mut torn = Vec::new();
        torn.extend_from_slice(&8u32.to_le_bytes());
        torn.extend_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        torn.extend_from_slice(&4u64.to_le_bytes());
        torn.extend_from_slice(&[0xAA; 8]);
        file.write_all(&torn).expect("write");
        file.sync_all().expect("sync");

        let mut scan = Segment::scan(&path).expect("scan");
        assert!(scan.truncated);
        assert_eq!(scan.record_count, 3);
        Segment::truncate_torn(&path, &mut scan).expect("truncate torn tail");

        let recovered = Segment::open_recovered(&path, &scan, true).expect("recover");
        assert_eq!(recovered.count(), 3);
        assert_eq!(recovered.last_index(), 3);
        recovered.append_entry(4, b"resumed").expect("append");
        assert_eq!(recovered.get(4).expect("get"), Some(&b"resumed"[..]));
    }

    #[test]
    fn truncate_from_drops_tail_entries() {
        let dir = TempDir::new().expect("tempdir");
        let segment = test_segment(&dir, 1, 8);
        for index in 1..=6 {
            segment
                .append_entry(index, format!("entry-{index}").as_bytes())
                .expect("append");
        }
        segment.clean(5);

        let removed = segment.truncate_from(3).expect("truncate");
        assert_eq!(removed, 3);
        assert_eq!(segment.count(), 3);
        assert_eq!(segment.clean_count(), 0);
        assert_eq!(segment.last_index(), 3);
        assert_eq!(segment.get(4).expect("get"), None);

        // The log continues where the truncation left off.
        segment.append_entry(4, b"replacement").expect("append");
        assert_eq!(segment.get(4).expect("get"), Some(&b"replacement"[..]));
    }
}
