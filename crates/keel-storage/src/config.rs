use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;

/// Index of an entry in the replicated log.
///
/// Raft indices are dense and monotonically increasing; the first entry of a
/// log is index 1. Index 0 is reserved as the "empty log" sentinel.
pub type LogIndex = u64;

/// First valid index of a non-empty log.
pub const FIRST_LOG_INDEX: LogIndex = 1;

/// Minimum allowed segment size (64 KiB).
///
/// Segments smaller than this lead to excessive metadata overhead and poor
/// I/O behavior from frequent file operations.
const SEGMENT_SIZE_MIN_LIMIT: u64 = 64 * 1024; // 64 KiB

/// Maximum allowed segment size (~4 GiB).
///
/// Limited by u32::MAX so offsets within a segment fit 32 bits for compact
/// slot tables and efficient memory mapping.
const SEGMENT_SIZE_MAX_LIMIT: u64 = u32::MAX as u64; // ~4 GiB

/// Default segment file size.
const DEFAULT_SEGMENT_MAX_BYTES: u64 = 4 * 1024 * 1024; // 4 MiB

/// Smallest accepted slot capacity per segment.
const SEGMENT_CAPACITY_MIN_LIMIT: u32 = 8;

/// Largest accepted slot capacity per segment.
///
/// Bounds the in-memory slot table and tombstone bitmap of a single segment.
const SEGMENT_CAPACITY_MAX_LIMIT: u32 = 1 << 24;

/// Default number of entry slots per segment.
const DEFAULT_SEGMENT_CAPACITY: u32 = 1024;

/// Default clean-ratio threshold at which a version-1 segment becomes hot.
const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.5;

/// Default minor compaction tick interval (milliseconds).
const DEFAULT_MINOR_INTERVAL_MS: u64 = 60_000;

/// Floor for the minor compaction tick interval (milliseconds).
const MINOR_INTERVAL_MIN_MS: u64 = 10;

/// Computes the largest power of two that is less than or equal to the input.
#[inline]
fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        let shift = 63_u32 - value.leading_zeros();
        1_u64 << shift
    }
}

/// Clamps a value to the given range and rounds to the nearest power of two.
#[inline]
fn clamp_power_of_two(value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }

    let lower = floor_power_of_two(clamped).max(min);
    let upper = (lower << 1).min(max).max(min);

    if clamped - lower <= upper.saturating_sub(clamped) {
        lower
    } else {
        upper
    }
}

/// Stable identifier of a logical segment.
///
/// A segment keeps its id across compaction rewrites; only the descriptor
/// version changes. Ids are monotonically increasing in creation order, so a
/// freshly rolled tail segment always carries the highest id in the log.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creates a new segment id from a raw u64 value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the segment id as a u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next segment id in sequence.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for SegmentId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SegmentId> for u64 {
    #[inline]
    fn from(value: SegmentId) -> Self {
        value.0
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Tuning knobs for the minor compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Clean-ratio bar a version-1 segment must cross to be rewritten.
    ///
    /// The effective bar for a version-`v` segment is `threshold / v`: each
    /// survived rewrite lowers the bar, biasing the planner toward segments
    /// that have accumulated several cleaning cycles. Values outside (0, 1]
    /// are normalized back to the default.
    pub threshold: f64,

    /// Interval between minor compaction ticks (milliseconds).
    ///
    /// A planning pass that outlives the interval is allowed to finish; the
    /// next tick simply waits.
    pub minor_interval_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPACTION_THRESHOLD,
            minor_interval_ms: DEFAULT_MINOR_INTERVAL_MS,
        }
    }
}

impl CompactionConfig {
    /// Minor compaction tick interval as a [`Duration`].
    #[inline]
    pub fn minor_interval(&self) -> Duration {
        Duration::from_millis(self.minor_interval_ms)
    }
}

/// Primary configuration surface for a segmented log instance.
///
/// Segment byte sizes are rounded into a power-of-two window and slot
/// capacities clamped to supported limits by [`StorageConfig::normalized`],
/// which should be applied after loading configuration from external sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory containing the segments/ subdirectory.
    pub root_dir: PathBuf,

    /// Number of entry slots per freshly created segment.
    ///
    /// This is the capacity tier reported by `Segment::length`; rewritten
    /// segments keep the tier of the largest segment that contributed to them
    /// even when their physical entry count shrinks.
    pub segment_capacity: u32,

    /// Size of a single segment file (bytes).
    ///
    /// A segment also seals when its byte budget runs out before its slot
    /// capacity, e.g. under unusually large entries.
    pub segment_max_bytes: u64,

    /// Minor compaction tuning.
    pub compaction: CompactionConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/log"),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            compaction: CompactionConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Returns a copy of the configuration with all parameters validated and
    /// rounded into supported windows.
    pub fn normalized(mut self) -> Self {
        let capacity_raw = if self.segment_capacity == 0 {
            DEFAULT_SEGMENT_CAPACITY
        } else {
            self.segment_capacity
        };
        self.segment_capacity =
            capacity_raw.clamp(SEGMENT_CAPACITY_MIN_LIMIT, SEGMENT_CAPACITY_MAX_LIMIT);

        let bytes_raw = if self.segment_max_bytes == 0 {
            DEFAULT_SEGMENT_MAX_BYTES
        } else {
            self.segment_max_bytes
        };
        self.segment_max_bytes =
            clamp_power_of_two(bytes_raw, SEGMENT_SIZE_MIN_LIMIT, SEGMENT_SIZE_MAX_LIMIT);

        if !self.compaction.threshold.is_finite() || self.compaction.threshold <= 0.0 {
            self.compaction.threshold = DEFAULT_COMPACTION_THRESHOLD;
        } else if self.compaction.threshold > 1.0 {
            self.compaction.threshold = 1.0;
        }

        if self.compaction.minor_interval_ms < MINOR_INTERVAL_MIN_MS {
            self.compaction.minor_interval_ms = MINOR_INTERVAL_MIN_MS;
        }

        self
    }

    /// Clean-ratio threshold consumed by the compaction planner.
    #[inline]
    pub fn compaction_threshold(&self) -> f64 {
        self.compaction.threshold
    }
}

impl Display for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageConfig(root_dir={:?}, segment_capacity={}, segment_max_bytes={}, compaction_threshold={}, minor_interval_ms={})",
            self.root_dir,
            self.segment_capacity,
            self.segment_max_bytes,
            self.compaction.threshold,
            self.compaction.minor_interval_ms
        )
    }
}
