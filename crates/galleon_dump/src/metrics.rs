//! In-process counters for dump progress and queue health.
//!
//! These are plain atomics so writer workers can update them on hot paths
//! without locks. The status endpoint and the progress log loop read
//! consistent-enough snapshots.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::task::DEFAULT_DUMP_THREADS;

/// Shared dump progress counters.
#[derive(Debug)]
pub struct DumpMetrics {
    /// Tables whose final chunk finished writing.
    finished_tables: AtomicU64,
    /// Data chunk tasks completed by workers.
    finished_chunks: AtomicU64,
    /// All tasks (schema + data) completed by workers.
    finished_tasks: AtomicU64,
    /// Rows written across all workers.
    finished_rows: AtomicU64,
    /// Estimated total rows, from the pre-dump estimate pass.
    estimated_total_rows: AtomicU64,
    /// Free capacity of the task queue (gauge).
    queue_free: AtomicI64,
}

/// Point-in-time view of the counters, serialized by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub finished_tables: u64,
    pub finished_chunks: u64,
    pub finished_tasks: u64,
    pub finished_rows: u64,
    pub estimated_total_rows: u64,
    pub queue_free: i64,
}

impl Default for DumpMetrics {
    fn default() -> Self {
        Self {
            finished_tables: AtomicU64::new(0),
            finished_chunks: AtomicU64::new(0),
            finished_tasks: AtomicU64::new(0),
            finished_rows: AtomicU64::new(0),
            estimated_total_rows: AtomicU64::new(0),
            queue_free: AtomicI64::new(DEFAULT_DUMP_THREADS as i64),
        }
    }
}

impl DumpMetrics {
    pub fn inc_finished_tables(&self) {
        self.finished_tables.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_finished_chunks(&self) {
        self.finished_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_finished_tasks(&self) {
        self.finished_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_finished_rows(&self, rows: u64) {
        self.finished_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn set_estimated_total_rows(&self, rows: u64) {
        self.estimated_total_rows.store(rows, Ordering::Relaxed);
    }

    pub fn dec_queue_free(&self) {
        self.queue_free.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_queue_free(&self) {
        self.queue_free.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            finished_tables: self.finished_tables.load(Ordering::Relaxed),
            finished_chunks: self.finished_chunks.load(Ordering::Relaxed),
            finished_tasks: self.finished_tasks.load(Ordering::Relaxed),
            finished_rows: self.finished_rows.load(Ordering::Relaxed),
            estimated_total_rows: self.estimated_total_rows.load(Ordering::Relaxed),
            queue_free: self.queue_free.load(Ordering::Relaxed),
        }
    }
}
