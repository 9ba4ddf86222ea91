//! Writer workers: drain the task queue and serialize results.
//!
//! Each worker owns one consistency-primed connection. Schema tasks go
//! straight to the external store; data tasks execute their chunk queries on
//! the worker's connection. A broken data connection is rebuilt once when
//! the active regime permits, after probing that the lock-holding connection
//! is still alive.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DumpConfig;
use crate::consistency::{create_conn_with_consistency, ConsistencyController};
use crate::metadata::GlobalMetadata;
use crate::metrics::DumpMetrics;
use crate::sql::{quote_ident, SqlConn, SqlPool};
use crate::storage::ExternalStorage;
use crate::task::{ChunkSource, TableMeta, Task};

/// Serialization seam: how finished tasks become artifacts. The orchestrator
/// only guarantees the call order per table; naming and layout belong here.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn write_database_meta(&self, database: &str, create_sql: &str) -> Result<()>;

    async fn write_table_meta(&self, database: &str, table: &str, create_sql: &str)
        -> Result<()>;

    async fn write_view_meta(
        &self,
        database: &str,
        view: &str,
        create_table_sql: &str,
        create_view_sql: &str,
    ) -> Result<()>;

    /// Executes the chunk queries on `conn` and writes one artifact.
    /// Returns the number of rows written.
    async fn write_table_data(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        chunk: &ChunkSource,
        chunk_index: usize,
    ) -> Result<u64>;
}

/// Narrow capability handed to workers for replacing a broken connection.
pub struct ConnRebuilder {
    pub controller: Arc<Mutex<ConsistencyController>>,
    pub pool: Arc<dyn SqlPool>,
    pub config: Arc<DumpConfig>,
    pub metadata: Arc<Mutex<GlobalMetadata>>,
}

impl ConnRebuilder {
    /// Probes the lock connection, then hands out a fresh consistency-primed
    /// connection. Under `pos_after_connect` the server position is recorded
    /// again so downstream consumers get a safe-mode exit point.
    pub async fn rebuild(&self) -> Result<Box<dyn SqlConn>> {
        self.controller.lock().await.ping().await?;
        let mut conn = create_conn_with_consistency(self.pool.as_ref(), &self.config).await?;
        if self.config.pos_after_connect {
            self.metadata
                .lock()
                .await
                .record_global_metadata(conn.as_mut(), self.config.server_info.kind, true)
                .await?;
        }
        Ok(conn)
    }
}

/// Receiver end of the task queue, shared by all workers.
pub type TaskQueue = Arc<Mutex<mpsc::Receiver<Task>>>;

pub struct Writer {
    id: usize,
    conn: Box<dyn SqlConn>,
    sink: Arc<dyn TaskSink>,
    rebuilder: Arc<ConnRebuilder>,
    can_rebuild: bool,
    metrics: Arc<DumpMetrics>,
    cancel: CancellationToken,
}

impl Writer {
    async fn run(mut self, queue: TaskQueue) -> Result<()> {
        loop {
            let task = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    task = rx.recv() => task,
                }
            };
            // Queue closed: all producers finished, drain is complete.
            let Some(task) = task else { return Ok(()) };
            if let Err(err) = self.handle_task(&task).await {
                tracing::error!(
                    worker = self.id,
                    task = %task.brief(),
                    error = %err,
                    "dump task failed"
                );
                // First failure cancels the whole dump.
                self.cancel.cancel();
                return Err(err);
            }
            self.finish_task(&task);
        }
    }

    fn finish_task(&self, task: &Task) {
        self.metrics.inc_finished_tasks();
        self.metrics.inc_queue_free();
        if let Task::TableData {
            meta,
            chunk_index,
            total_chunks,
            ..
        } = task
        {
            self.metrics.inc_finished_chunks();
            tracing::debug!(
                database = %meta.database,
                table = %meta.table,
                chunk_index,
                "finished table data task"
            );
            // Approximate: chunks may finish out of order, so the last index
            // is not necessarily the last chunk to complete.
            if chunk_index + 1 == *total_chunks {
                self.metrics.inc_finished_tables();
            }
        }
    }

    async fn handle_task(&mut self, task: &Task) -> Result<()> {
        match task {
            Task::DatabaseMeta {
                database,
                create_sql,
            } => self.sink.write_database_meta(database, create_sql).await,
            Task::TableMeta {
                database,
                table,
                create_sql,
            } => {
                self.sink
                    .write_table_meta(database, table, create_sql)
                    .await
            }
            Task::ViewMeta {
                database,
                view,
                create_table_sql,
                create_view_sql,
            } => {
                self.sink
                    .write_view_meta(database, view, create_table_sql, create_view_sql)
                    .await
            }
            Task::TableData {
                meta,
                chunk,
                chunk_index,
                ..
            } => self
                .handle_data_task(meta, chunk, *chunk_index)
                .await
                .map(|_| ()),
        }
    }

    async fn handle_data_task(
        &mut self,
        meta: &TableMeta,
        chunk: &ChunkSource,
        chunk_index: usize,
    ) -> Result<u64> {
        match self
            .sink
            .write_table_data(self.conn.as_mut(), meta, chunk, chunk_index)
            .await
        {
            Ok(rows) => {
                self.metrics.add_finished_rows(rows);
                Ok(rows)
            }
            Err(err) if self.can_rebuild => {
                tracing::warn!(
                    worker = self.id,
                    database = %meta.database,
                    table = %meta.table,
                    chunk_index,
                    error = %err,
                    "data task failed, rebuilding connection and retrying once"
                );
                self.conn = self.rebuilder.rebuild().await?;
                let rows = self
                    .sink
                    .write_table_data(self.conn.as_mut(), meta, chunk, chunk_index)
                    .await?;
                self.metrics.add_finished_rows(rows);
                Ok(rows)
            }
            Err(err) => Err(err),
        }
    }
}

/// Join handles of the running worker pool; the first error wins.
pub struct WriterPool {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl WriterPool {
    pub async fn join(self) -> Result<()> {
        let mut joins: FuturesUnordered<_> = self.handles.into_iter().collect();
        let mut first_error = None;
        while let Some(joined) = joins.next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => anyhow::anyhow!("worker panicked: {join_err}"),
            };
            if first_error.is_none() {
                first_error = Some(failure);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Starts `config.threads` workers. All worker connections are acquired (and
/// their transactions begun) before this returns, so the caller may release
/// a transactional lock immediately afterwards.
#[allow(clippy::too_many_arguments)]
pub async fn start_writers(
    config: Arc<DumpConfig>,
    pool: Arc<dyn SqlPool>,
    sink: Arc<dyn TaskSink>,
    rebuilder: Arc<ConnRebuilder>,
    can_rebuild: bool,
    metrics: Arc<DumpMetrics>,
    cancel: CancellationToken,
    queue: TaskQueue,
) -> Result<WriterPool> {
    let mut handles = Vec::with_capacity(config.threads);
    for id in 0..config.threads {
        let conn = create_conn_with_consistency(pool.as_ref(), &config)
            .await
            .with_context(|| format!("prime connection for worker {id}"))?;
        let writer = Writer {
            id,
            conn,
            sink: sink.clone(),
            rebuilder: rebuilder.clone(),
            can_rebuild,
            metrics: metrics.clone(),
            cancel: cancel.clone(),
        };
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { writer.run(queue).await }));
    }
    Ok(WriterPool { handles })
}

/// Default sink: renders artifacts as SQL files in the external store.
pub struct StorageSink {
    store: Arc<dyn ExternalStorage>,
}

impl StorageSink {
    pub fn new(store: Arc<dyn ExternalStorage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskSink for StorageSink {
    async fn write_database_meta(&self, database: &str, create_sql: &str) -> Result<()> {
        let name = format!("{database}-schema-create.sql");
        self.store
            .write_artifact(&name, format!("{create_sql};\n").as_bytes())
            .await
    }

    async fn write_table_meta(
        &self,
        database: &str,
        table: &str,
        create_sql: &str,
    ) -> Result<()> {
        let name = format!("{database}.{table}-schema.sql");
        self.store
            .write_artifact(&name, format!("{create_sql};\n").as_bytes())
            .await
    }

    async fn write_view_meta(
        &self,
        database: &str,
        view: &str,
        create_table_sql: &str,
        create_view_sql: &str,
    ) -> Result<()> {
        let name = format!("{database}.{view}-schema-view.sql");
        let content = format!("{create_table_sql}\n{create_view_sql};\n");
        self.store.write_artifact(&name, content.as_bytes()).await
    }

    async fn write_table_data(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        chunk: &ChunkSource,
        chunk_index: usize,
    ) -> Result<u64> {
        let mut content = String::new();
        for comment in &meta.leading_comments {
            content.push_str(comment);
            content.push('\n');
        }
        let mut rows_written = 0u64;
        for query in chunk.queries() {
            let rows = conn.query(query).await?;
            if rows.is_empty() {
                continue;
            }
            if meta.table.is_empty() {
                // Raw SQL mode has no insert target; keep the bare values.
                content.push_str("/* raw query result */\n");
            } else if meta.selected_field.is_empty() {
                content.push_str(&format!("INSERT INTO {} VALUES\n", quote_ident(&meta.table)));
            } else {
                content.push_str(&format!(
                    "INSERT INTO {} ({}) VALUES\n",
                    quote_ident(&meta.table),
                    meta.selected_field
                ));
            }
            for (i, row) in rows.iter().enumerate() {
                let values = row
                    .iter()
                    .map(|value| match value {
                        Some(text) => crate::sql::quote_str(text),
                        None => "NULL".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                let terminator = if i + 1 == rows.len() { ";\n" } else { ",\n" };
                content.push_str(&format!("({values}){terminator}"));
                rows_written += 1;
            }
        }
        let name = if meta.table.is_empty() {
            format!("result.{chunk_index}.sql")
        } else {
            format!("{}.{}.{chunk_index}.sql", meta.database, meta.table)
        };
        self.store.write_artifact(&name, content.as_bytes()).await?;
        Ok(rows_written)
    }
}
