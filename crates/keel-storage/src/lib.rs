//! Segmented storage engine for a Raft-replicated log.
//!
//! The log is a totally ordered sequence of committed entries stored as an
//! append-only series of fixed-capacity segments on disk. Entries become
//! obsolete when the state machine tombstones them via `clean`; the minor
//! compaction pass periodically rewrites chosen segments in place, omitting
//! cleaned entries while preserving every surviving index.
//!
//! ## Architecture Overview
//!
//! - **Segments**: memory-mapped fixed-size files addressed by slot
//!   (`index - base`), sealed when full and checksummed end to end
//! - **Segment manager**: base-index ordered directory over segment handles,
//!   recovery, rollover, and the atomic swap consumed by rewrites
//! - **Minor compaction planner**: pure selection and grouping of adjacent
//!   rewritable segments under a generational clean-ratio heuristic
//! - **Rewrite tasks**: stage a new-version segment under a temp name and
//!   swap it in only after its footer is durable
//! - **Compaction worker**: background thread ticking at the configured
//!   interval, with atomic metrics counters
//!
//! ## Key Components
//!
//! - [`Log`]: append / read / clean / commit / truncate facade
//! - [`SegmentManager`]: directory index and commit tracker
//! - [`MinorCompactionPlanner`]: builds [`RewriteTask`]s for one pass
//! - [`CompactionWorker`]: drives planning and execution periodically
//!
//! ## Example Usage
//!
//! ```no_run
//! use keel_storage::{CompactionWorker, Log, StorageConfig};
//!
//! let log = Log::open(StorageConfig::default())?;
//! let index = log.append(b"payload")?;
//! log.commit(index);
//! log.clean(index)?;
//!
//! // Reclaim cleaned entries in the background.
//! let worker = CompactionWorker::spawn(log.config().clone(), log.manager().clone());
//! worker.kick();
//! # Ok::<(), keel_storage::StorageError>(())
//! ```
//!
//! ## Thread Safety
//!
//! Reads are lock-free against immutable mapped data; appends, rollover,
//! truncation, and compaction swaps serialize behind the manager's write
//! lock. Readers holding segment handles across a swap keep observing valid
//! data until they release them.

pub mod compaction;
pub mod config;
pub mod error;
pub mod fs;
pub mod manager;
pub mod segment;
pub mod test_support;

mod log;

pub use compaction::{
    CompactableSegment, CompactionMetrics, CompactionMetricsSnapshot, CompactionWorker,
    MinorCompactionPlanner, RewriteTask, SegmentStore,
};
pub use config::{CompactionConfig, FIRST_LOG_INDEX, LogIndex, SegmentId, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use fs::{
    Layout, SEGMENT_FILE_EXTENSION, SegmentFileName, TempFileGuard, create_fixed_size_file,
    fsync_dir,
};
pub use log::Log;
pub use manager::SegmentManager;
pub use segment::{Segment, SegmentDescriptor, SegmentFooter};

/// Named metric sample produced by the compaction worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionMetricSample {
    /// Static name of the metric (e.g., "log_compaction_passes_total")
    pub name: &'static str,
    /// Current value of the metric
    pub value: u64,
}

/// Helper for exporting compaction metrics snapshots with stable metric
/// names, suitable for Prometheus-style collectors.
///
/// # Example
///
/// ```ignore
/// let exporter = CompactionMetricsExporter::new(worker.metrics());
/// exporter.emit(|sample| {
///     registry.gauge(sample.name).set(sample.value as f64);
/// });
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CompactionMetricsExporter {
    snapshot: CompactionMetricsSnapshot,
}

impl CompactionMetricsExporter {
    /// Creates a new exporter from a compaction metrics snapshot.
    pub fn new(snapshot: CompactionMetricsSnapshot) -> Self {
        Self { snapshot }
    }

    /// Returns an iterator over all compaction metric samples.
    pub fn samples(&self) -> impl Iterator<Item = CompactionMetricSample> + use<'_> {
        const METRIC_NAMES: [(&str, fn(&CompactionMetricsSnapshot) -> u64); 7] = [
            ("log_compaction_passes_total", |s| s.passes),
            ("log_compaction_planned_tasks_total", |s| s.planned_tasks),
            ("log_compaction_rewritten_groups_total", |s| {
                s.rewritten_groups
            }),
            ("log_compaction_merged_segments_total", |s| s.merged_segments),
            ("log_compaction_dropped_entries_total", |s| s.dropped_entries),
            ("log_compaction_failed_tasks_total", |s| s.failed_tasks),
            ("log_compaction_last_pass_millis", |s| s.last_pass_millis),
        ];
        METRIC_NAMES
            .into_iter()
            .map(move |(name, accessor)| CompactionMetricSample {
                name,
                value: accessor(&self.snapshot),
            })
    }

    /// Emits all compaction metrics using the provided callback function.
    pub fn emit<F>(&self, mut writer: F)
    where
        F: FnMut(CompactionMetricSample),
    {
        for sample in self.samples() {
            writer(sample);
        }
    }
}
