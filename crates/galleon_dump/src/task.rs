//! Units of work handed from the chunker to the writer workers.
//!
//! A dump is a stream of tasks: per-database schema DDL, per-table schema DDL,
//! and data chunks. Within one table the producer enqueues schema before data;
//! across tables workers interleave freely.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::DumpMetrics;

/// Queue depth between the chunker and the writer workers.
///
/// Producers block once this many tasks are pending, which is the only
/// backpressure mechanism between chunk generation and serialization.
pub const DEFAULT_DUMP_THREADS: usize = 128;

/// Metadata captured for one table before its data is dumped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    pub database: String,
    pub table: String,
    /// Number of columns a data chunk query selects.
    pub column_count: usize,
    /// Explicit column list, or empty to select all columns.
    pub selected_field: String,
    pub create_table_ddl: Option<String>,
    pub create_view_ddl: Option<String>,
    /// Comment lines emitted ahead of any rendered statement.
    pub leading_comments: Vec<String>,
}

impl TableMeta {
    /// The field list to splice into a SELECT; `*` when no explicit list was built.
    pub fn select_field(&self) -> &str {
        if self.selected_field.is_empty() {
            "*"
        } else {
            &self.selected_field
        }
    }
}

/// Source of the rows for one data chunk. The writer executes the contained
/// SQL on its own connection and streams the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    /// One SELECT producing all rows of this chunk.
    SingleQuery {
        sql: String,
        column_count: usize,
        /// Raw user SQL (`--sql` mode); the writer must not rewrite it.
        is_raw: bool,
    },
    /// Several SELECTs whose concatenated output is one logical chunk.
    MultiQuery { sqls: Vec<String>, column_count: usize },
}

impl ChunkSource {
    pub fn queries(&self) -> Vec<&str> {
        match self {
            ChunkSource::SingleQuery { sql, .. } => vec![sql.as_str()],
            ChunkSource::MultiQuery { sqls, .. } => sqls.iter().map(String::as_str).collect(),
        }
    }

    pub fn column_count(&self) -> usize {
        match self {
            ChunkSource::SingleQuery { column_count, .. } => *column_count,
            ChunkSource::MultiQuery { column_count, .. } => *column_count,
        }
    }
}

/// One unit of work for a writer worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    DatabaseMeta {
        database: String,
        create_sql: String,
    },
    TableMeta {
        database: String,
        table: String,
        create_sql: String,
    },
    ViewMeta {
        database: String,
        view: String,
        create_table_sql: String,
        create_view_sql: String,
    },
    TableData {
        meta: TableMeta,
        chunk: ChunkSource,
        chunk_index: usize,
        total_chunks: usize,
    },
}

impl Task {
    /// Short description used in log lines.
    pub fn brief(&self) -> String {
        match self {
            Task::DatabaseMeta { database, .. } => format!("meta of database '{database}'"),
            Task::TableMeta { database, table, .. } => {
                format!("meta of table '{database}'.'{table}'")
            }
            Task::ViewMeta { database, view, .. } => format!("meta of view '{database}'.'{view}'"),
            Task::TableData {
                meta,
                chunk_index,
                total_chunks,
                ..
            } => format!(
                "data of table '{}'.'{}'({}/{})",
                meta.database, meta.table, chunk_index, total_chunks
            ),
        }
    }
}

enum SenderKind {
    /// The bounded queue feeding the worker pool.
    Queue(mpsc::Sender<Task>),
    /// Unbounded local collection used when merging sub-chunks of one table.
    Local(mpsc::UnboundedSender<Task>),
}

/// Producer handle for the task queue. Sending blocks when the queue is full
/// and fails once the dump is cancelled, so chunkers stop promptly.
pub struct TaskSender {
    kind: SenderKind,
    cancel: CancellationToken,
    metrics: Option<Arc<DumpMetrics>>,
}

impl TaskSender {
    pub fn new(
        tx: mpsc::Sender<Task>,
        cancel: CancellationToken,
        metrics: Arc<DumpMetrics>,
    ) -> Self {
        Self {
            kind: SenderKind::Queue(tx),
            cancel,
            metrics: Some(metrics),
        }
    }

    /// A sender that collects into a local unbounded channel, used by the
    /// sequential "concat" build to gather sub-chunks of a single table.
    pub fn local(tx: mpsc::UnboundedSender<Task>, cancel: CancellationToken) -> Self {
        Self {
            kind: SenderKind::Local(tx),
            cancel,
            metrics: None,
        }
    }

    pub async fn send(&self, task: Task) -> Result<()> {
        tracing::debug!(task = %task.brief(), "send task to writer");
        match &self.kind {
            SenderKind::Queue(tx) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => bail!("dump cancelled"),
                    sent = tx.send(task) => {
                        if sent.is_err() {
                            bail!("task queue closed before producers finished");
                        }
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics.dec_queue_free();
                }
            }
            SenderKind::Local(tx) => {
                if self.cancel.is_cancelled() {
                    bail!("dump cancelled");
                }
                if tx.send(task).is_err() {
                    bail!("local task channel closed");
                }
            }
        }
        Ok(())
    }
}
