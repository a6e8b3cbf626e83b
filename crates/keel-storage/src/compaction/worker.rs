use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, unbounded};
use tracing::{debug, error, warn};

use super::MinorCompactionPlanner;
use crate::config::StorageConfig;
use crate::manager::SegmentManager;

pub enum CompactionCommand {
    RunOnce,
    Shutdown,
}

/// Counters describing minor compaction activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionMetricsSnapshot {
    pub passes: u64,
    pub planned_tasks: u64,
    pub rewritten_groups: u64,
    pub merged_segments: u64,
    pub dropped_entries: u64,
    pub failed_tasks: u64,
    pub last_pass_millis: u64,
}

#[derive(Default)]
pub struct CompactionMetrics {
    passes: AtomicU64,
    planned_tasks: AtomicU64,
    rewritten_groups: AtomicU64,
    merged_segments: AtomicU64,
    dropped_entries: AtomicU64,
    failed_tasks: AtomicU64,
    last_pass_millis: AtomicU64,
}

impl CompactionMetrics {
    #[inline]
    pub fn incr_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.last_pass_millis.store(now_millis(), Ordering::Relaxed);
    }

    #[inline]
    pub fn add_planned(&self, tasks: u64) {
        if tasks > 0 {
            self.planned_tasks.fetch_add(tasks, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_rewrite(&self, merged: u64, dropped: u64) {
        self.rewritten_groups.fetch_add(1, Ordering::Relaxed);
        self.merged_segments.fetch_add(merged, Ordering::Relaxed);
        self.dropped_entries.fetch_add(dropped, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_failed(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompactionMetricsSnapshot {
        CompactionMetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            planned_tasks: self.planned_tasks.load(Ordering::Relaxed),
            rewritten_groups: self.rewritten_groups.load(Ordering::Relaxed),
            merged_segments: self.merged_segments.load(Ordering::Relaxed),
            dropped_entries: self.dropped_entries.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            last_pass_millis: self.last_pass_millis.load(Ordering::Relaxed),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::ZERO)
        .as_millis() as u64
}

/// Background driver for minor compaction.
///
/// A dedicated thread ticks at the configured `minor_interval`, plans a pass
/// on a snapshot of the segment directory, and executes the resulting tasks
/// sequentially. Groups partition the cleanable set, so no two tasks of one
/// pass ever touch the same segment range; a failed task is abandoned and its
/// segments reappear on the next tick.
pub struct CompactionWorker {
    command_tx: Sender<CompactionCommand>,
    metrics: Arc<CompactionMetrics>,
}

impl CompactionWorker {
    pub fn spawn(config: StorageConfig, manager: Arc<SegmentManager>) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let metrics = Arc::new(CompactionMetrics::default());
        let worker = Arc::new(Self {
            command_tx: tx,
            metrics: metrics.clone(),
        });
        let _ = thread::Builder::new()
            .name("keel-compaction".to_string())
            .spawn(move || Self::worker_loop(rx, config, manager, metrics));
        worker
    }

    /// Requests an immediate pass without waiting for the next tick.
    pub fn kick(&self) -> bool {
        match self.command_tx.try_send(CompactionCommand::RunOnce) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn metrics(&self) -> CompactionMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn worker_loop(
        rx: Receiver<CompactionCommand>,
        config: StorageConfig,
        manager: Arc<SegmentManager>,
        metrics: Arc<CompactionMetrics>,
    ) {
        let interval = config.compaction.minor_interval();
        loop {
            match rx.recv_timeout(interval) {
                Ok(CompactionCommand::RunOnce) | Err(RecvTimeoutError::Timeout) => {
                    Self::run_pass(&config, &manager, &metrics);
                }
                Ok(CompactionCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn run_pass(config: &StorageConfig, manager: &Arc<SegmentManager>, metrics: &CompactionMetrics) {
        metrics.incr_pass();
        let tasks = MinorCompactionPlanner::build_tasks(config, manager);
        if tasks.is_empty() {
            return;
        }
        metrics.add_planned(tasks.len() as u64);

        for task in tasks {
            let merged = task.segments().len() as u64;
            let old_count: u64 = task.segments().iter().map(|segment| segment.count()).sum();
            match task.execute() {
                Ok(replacement) => {
                    metrics.record_rewrite(merged, old_count.saturating_sub(replacement.count()));
                }
                Err(err) if err.is_transient() => {
                    metrics.incr_failed();
                    warn!(
                        base = task.first_index(),
                        error = %err,
                        "compaction task failed; segments return to the eligible set"
                    );
                }
                Err(err) => {
                    metrics.incr_failed();
                    error!(
                        base = task.first_index(),
                        error = %err,
                        "compaction task hit an unrecoverable segment"
                    );
                }
            }
        }
        debug!(
            passes = metrics.snapshot().passes,
            "minor compaction pass complete"
        );
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        let _ = self.command_tx.send(CompactionCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_accumulate() {
        let metrics = CompactionMetrics::default();
        metrics.incr_pass();
        metrics.add_planned(2);
        metrics.record_rewrite(3, 40);
        metrics.record_rewrite(1, 7);
        metrics.incr_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.passes, 1);
        assert_eq!(snapshot.planned_tasks, 2);
        assert_eq!(snapshot.rewritten_groups, 2);
        assert_eq!(snapshot.merged_segments, 4);
        assert_eq!(snapshot.dropped_entries, 47);
        assert_eq!(snapshot.failed_tasks, 1);
        assert!(snapshot.last_pass_millis > 0);
    }
}
