//! The dump orchestrator: initialization pipeline, the dump state machine,
//! and teardown.
//!
//! `Dumper::new` runs the ordered init steps (probe, consistency resolution,
//! snapshot/safepoint plumbing, session parameters). `dump()` then drives
//! the phases: enumerate, set up consistency, record metadata, start the
//! worker pool, chunk every table through the bounded queue, drain, and
//! write the metadata artifact iff everything succeeded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{
    dump_table_meta, prepare_table_list, show_create_database, DatabaseTables, TableKind,
};
use crate::chunking::{RegionLookup, TableChunker};
use crate::config::{ConsistencyMode, DumpConfig};
use crate::consistency::{
    can_rebuild_conn, create_conn_with_consistency, resolve_auto_consistency,
    ConsistencyController,
};
use crate::keycodec::decode_record_key;
use crate::metadata::GlobalMetadata;
use crate::metrics::DumpMetrics;
use crate::safepoint::{
    parse_snapshot_to_tso, spawn_safepoint_keeper, CoordinatorClient,
    DEFAULT_GC_SAFEPOINT_TTL_SECS,
};
use crate::server::{gc_safepoint_version, ServerInfo, ServerKind};
use crate::sql::{quote_str, MySqlPoolAdapter, SqlConn, SqlPool};
use crate::status::spawn_status_server;
use crate::storage::{ExternalStorage, LocalStorage};
use crate::task::{Task, TaskSender, DEFAULT_DUMP_THREADS};
use crate::worker::{start_writers, ConnRebuilder, StorageSink, TaskSink};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Orchestrates one logical dump.
pub struct Dumper {
    config: Arc<DumpConfig>,
    pool: Arc<dyn SqlPool>,
    store: Arc<dyn ExternalStorage>,
    sink: Arc<dyn TaskSink>,
    metrics: Arc<DumpMetrics>,
    cancel: CancellationToken,
    region_lookup: RegionLookup,
    tables: DatabaseTables,
    tables_prepared: bool,
    background: Vec<JoinHandle<()>>,
}

impl Dumper {
    /// Builds a dumper against a live server, creating the pool and the
    /// external store from the configuration.
    pub async fn new(mut config: DumpConfig) -> Result<Dumper> {
        config.adjust()?;
        let store: Arc<dyn ExternalStorage> =
            Arc::new(LocalStorage::create(config.output.clone()).await?);
        let pool: Arc<dyn SqlPool> = Arc::new(
            MySqlPoolAdapter::connect(&config.dsn(), (config.threads + 4) as u32).await?,
        );
        let sink = Arc::new(StorageSink::new(store.clone()));
        Self::with_parts(config, pool, store, sink, None).await
    }

    /// Builds a dumper from injected collaborators. Used when embedding the
    /// engine and by the integration tests.
    pub async fn with_parts(
        mut config: DumpConfig,
        pool: Arc<dyn SqlPool>,
        store: Arc<dyn ExternalStorage>,
        sink: Arc<dyn TaskSink>,
        coordinator: Option<Arc<dyn CoordinatorClient>>,
    ) -> Result<Dumper> {
        config.adjust()?;
        let metrics = Arc::new(DumpMetrics::default());
        let cancel = CancellationToken::new();
        let mut background = Vec::new();

        if let Some(addr) = config.status_addr {
            background.push(spawn_status_server(addr, metrics.clone(), cancel.clone()));
        }

        let mut conn = pool.acquire().await.context("probe connection")?;
        detect_server_info(&mut config, conn.as_mut()).await?;
        config.consistency = resolve_auto_consistency(config.consistency, config.server_info.kind);
        tracing::info!(
            server = %config.server_info.kind,
            version = ?config.server_info.version,
            consistency = %config.consistency,
            "detected server, resolved consistency"
        );

        let coordinator = setup_coordinator(&config, coordinator);
        acquire_snapshot(&mut config, conn.as_mut(), coordinator.is_some()).await;
        if let Some(client) = &coordinator {
            let tso = parse_snapshot_to_tso(conn.as_mut(), &config.snapshot)
                .await
                .context("resolve snapshot to a safepoint timestamp")?;
            background.push(spawn_safepoint_keeper(
                cancel.clone(),
                client.clone(),
                DEFAULT_GC_SAFEPOINT_TTL_SECS,
                tso,
            ));
        }
        apply_session_params(&mut config, conn.as_mut()).await?;
        drop(conn);

        Ok(Dumper {
            config: Arc::new(config),
            pool,
            store,
            sink,
            metrics,
            cancel,
            region_lookup: RegionLookup::Standard,
            tables: DatabaseTables::new(),
            tables_prepared: false,
            background,
        })
    }

    pub fn metrics(&self) -> Arc<DumpMetrics> {
        self.metrics.clone()
    }

    /// Executes the whole dump; blocks until completion or cancellation.
    pub async fn dump(&mut self) -> Result<()> {
        let config = self.config.clone();
        tracing::info!(consistency = %config.consistency, threads = config.threads, "begin dump");
        let metadata = Arc::new(Mutex::new(GlobalMetadata::new(config.snapshot.clone())));
        metadata.lock().await.record_start_time();

        // The lock regime needs the table list up front to build its LOCK
        // TABLES statement.
        if config.consistency == ConsistencyMode::Lock && config.sql.is_empty() {
            let mut conn = create_conn_with_consistency(self.pool.as_ref(), &config).await?;
            self.prepare_tables(conn.as_mut()).await?;
        }

        let mut controller = ConsistencyController::new(&config, &self.tables)?;
        controller.setup(self.pool.as_ref()).await?;
        let controller = Arc::new(Mutex::new(controller));

        let result = self.dump_with_consistency(&controller, &metadata).await;

        // Release on every exit path; a no-op when already torn down.
        let result = match (result, controller.lock().await.tear_down().await) {
            (Ok(()), Err(err)) => Err(err.context("tear down consistency controller")),
            (result, Err(err)) => {
                tracing::error!(error = %err, "fail to tear down consistency controller");
                result
            }
            (result, Ok(())) => result,
        };

        if result.is_ok() {
            let mut metadata = metadata.lock().await;
            metadata.record_finish_time();
            if let Err(err) = metadata.write_global_metadata(self.store.as_ref()).await {
                tracing::warn!(error = %err, "fail to write global metadata artifact");
            }
        }
        result
    }

    async fn dump_with_consistency(
        &mut self,
        controller: &Arc<Mutex<ConsistencyController>>,
        metadata: &Arc<Mutex<GlobalMetadata>>,
    ) -> Result<()> {
        let config = self.config.clone();
        let mut meta_conn = create_conn_with_consistency(self.pool.as_ref(), &config).await?;

        // The first recording is the replication start position; under lock
        // or flush it reflects the locked snapshot exactly.
        if let Err(err) = metadata
            .lock()
            .await
            .record_global_metadata(meta_conn.as_mut(), config.server_info.kind, false)
            .await
        {
            tracing::info!(error = %err, "get global metadata failed");
        }

        if config.sql.is_empty() && !self.tables_prepared {
            self.prepare_tables(meta_conn.as_mut()).await?;
        }
        if let Err(err) = self.renew_region_lookup_for_legacy_dsql(meta_conn.as_mut()).await {
            tracing::error!(error = %err, "fail to precompute region info for legacy DSQL");
        }
        if let Err(err) = self.estimate_total_rows(meta_conn.as_mut()).await {
            tracing::warn!(error = %err, "fail to estimate total rows count");
        }

        let (tx, rx) = mpsc::channel(DEFAULT_DUMP_THREADS);
        let queue = Arc::new(Mutex::new(rx));
        let rebuilder = Arc::new(ConnRebuilder {
            controller: controller.clone(),
            pool: self.pool.clone(),
            config: config.clone(),
            metadata: metadata.clone(),
        });
        let can_rebuild = can_rebuild_conn(config.consistency, config.transactional_consistency);
        let writers = start_writers(
            config.clone(),
            self.pool.clone(),
            self.sink.clone(),
            rebuilder,
            can_rebuild,
            self.metrics.clone(),
            self.cancel.clone(),
            queue,
        )
        .await?;

        if config.transactional_consistency
            && matches!(
                config.consistency,
                ConsistencyMode::Flush | ConsistencyMode::Lock
            )
        {
            tracing::info!("transactions started on all workers, unlocking tables");
            controller.lock().await.tear_down().await?;
        }

        if config.pos_after_connect {
            // Recorded on the metadata connection as an approximation of the
            // position when the last worker began its transaction.
            if let Err(err) = metadata
                .lock()
                .await
                .record_global_metadata(meta_conn.as_mut(), config.server_info.kind, true)
                .await
            {
                tracing::info!(error = %err, "get global metadata after connect failed");
            }
        }

        let progress = self.spawn_progress_logger();
        let sender = TaskSender::new(tx, self.cancel.clone(), self.metrics.clone());
        let chunker = TableChunker {
            config: config.as_ref(),
            region_lookup: &self.region_lookup,
            cancel: self.cancel.clone(),
        };
        let produced = if config.sql.is_empty() {
            dump_databases(&config, &chunker, meta_conn.as_mut(), &self.tables, &sender).await
        } else {
            chunker.dump_raw_sql(&sender).await
        };
        // Closing the queue (exactly once) signals workers to drain and exit.
        drop(sender);

        let drained = writers.join().await;
        progress.abort();

        match (produced, drained) {
            // A producer error after cancellation is a symptom; the worker
            // error is the cause.
            (Err(err), drained) if !self.cancel.is_cancelled() => {
                drained?;
                Err(err)
            }
            (_, Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Cancels the dump and stops all background tasks.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }
    }

    async fn prepare_tables(&mut self, conn: &mut dyn SqlConn) -> Result<()> {
        self.tables = prepare_table_list(conn, &self.config).await?;
        self.tables_prepared = true;
        let table_count: usize = self.tables.values().map(Vec::len).sum();
        tracing::info!(
            databases = self.tables.len(),
            tables = table_count,
            "enumerated tables to dump"
        );
        Ok(())
    }

    /// Servers that expose region status but cannot decode keys themselves
    /// get their region handles decoded client-side, once, up front.
    async fn renew_region_lookup_for_legacy_dsql(
        &mut self,
        conn: &mut dyn SqlConn,
    ) -> Result<()> {
        let info = &self.config.server_info;
        let legacy = info.kind == ServerKind::Dsql
            && info.has_distributed_storage
            && info.supports_region_decode()
            && info
                .version
                .as_ref()
                .is_some_and(|v| v < gc_safepoint_version());
        if !legacy {
            return Ok(());
        }

        let databases = self
            .tables
            .keys()
            .map(|db| quote_str(db))
            .collect::<Vec<_>>()
            .join(",");
        if databases.is_empty() {
            return Ok(());
        }
        let id_rows = conn
            .query(&format!(
                "SELECT TABLE_SCHEMA,TABLE_NAME,TIDB_TABLE_ID FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA IN ({databases})"
            ))
            .await
            .context("list table ids")?;
        let mut table_by_id: BTreeMap<i64, (String, String)> = BTreeMap::new();
        for row in id_rows {
            if let (Some(Some(db)), Some(Some(table)), Some(Some(id))) =
                (row.first(), row.get(1), row.get(2))
            {
                if let Ok(id) = id.parse::<i64>() {
                    table_by_id.insert(id, (db.clone(), table.clone()));
                }
            }
        }

        let key_rows = conn
            .query(
                "SELECT START_KEY FROM INFORMATION_SCHEMA.TIKV_REGION_STATUS \
                 WHERE IS_INDEX=0 ORDER BY START_KEY",
            )
            .await
            .context("list region start keys")?;
        let mut handles: BTreeMap<(String, String), Vec<i64>> = BTreeMap::new();
        for row in key_rows {
            let Some(Some(start_key)) = row.first() else {
                continue;
            };
            match decode_record_key(start_key) {
                Ok((table_id, handle)) => {
                    if let Some(key) = table_by_id.get(&table_id) {
                        handles.entry(key.clone()).or_default().push(handle);
                    }
                }
                Err(err) => {
                    tracing::debug!(start_key = %start_key, error = %err, "skip region start key");
                }
            }
        }
        for list in handles.values_mut() {
            list.sort_unstable();
        }
        tracing::info!(tables = handles.len(), "precomputed region handles for legacy DSQL");
        self.region_lookup = RegionLookup::Precomputed(handles);
        Ok(())
    }

    async fn estimate_total_rows(&self, conn: &mut dyn SqlConn) -> Result<()> {
        if self.tables.is_empty() {
            return Ok(());
        }
        let databases = self
            .tables
            .keys()
            .map(|db| quote_str(db))
            .collect::<Vec<_>>()
            .join(",");
        let row = conn
            .query_row(&format!(
                "SELECT SUM(TABLE_ROWS) FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA IN ({databases}) AND TABLE_TYPE='BASE TABLE'"
            ))
            .await?;
        if let Some(total) = row
            .and_then(|row| row.into_iter().next().flatten())
            .and_then(|text| text.parse::<u64>().ok())
        {
            self.metrics.set_estimated_total_rows(total);
        }
        Ok(())
    }

    fn spawn_progress_logger(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let snapshot = metrics.snapshot();
                tracing::info!(
                    finished_tables = snapshot.finished_tables,
                    finished_chunks = snapshot.finished_chunks,
                    finished_rows = snapshot.finished_rows,
                    estimated_total_rows = snapshot.estimated_total_rows,
                    "dump progress"
                );
            }
        })
    }
}

async fn detect_server_info(config: &mut DumpConfig, conn: &mut dyn SqlConn) -> Result<()> {
    let version_text = conn
        .query_row("SELECT version()")
        .await
        .context("select server version")?
        .and_then(|row| row.into_iter().next().flatten())
        .unwrap_or_default();
    config.server_info = ServerInfo::parse(&version_text);
    Ok(())
}

/// Keeps the injected coordinator only when the server honors service
/// safepoints; otherwise advises the operator.
fn setup_coordinator(
    config: &DumpConfig,
    coordinator: Option<Arc<dyn CoordinatorClient>>,
) -> Option<Arc<dyn CoordinatorClient>> {
    if config.server_info.supports_gc_safepoint() {
        if let Some(client) = coordinator {
            return Some(client);
        }
    }
    if config.server_info.kind == ServerKind::Dsql {
        tracing::warn!(
            "no coordinator client for GC control; for long dumps widen \
             tikv_gc_life_time before starting and restore it afterwards"
        );
    }
    None
}

/// Pins a snapshot when the server can provide one and either the snapshot
/// regime or a GC safepoint needs it. Best-effort: the dump proceeds at
/// current time when the position is unreadable.
async fn acquire_snapshot(config: &mut DumpConfig, conn: &mut dyn SqlConn, has_coordinator: bool) {
    if config.server_info.kind != ServerKind::Dsql
        || !config.snapshot.is_empty()
        || !(has_coordinator || config.consistency == ConsistencyMode::Snapshot)
    {
        return;
    }
    match conn.query_row("SHOW MASTER STATUS").await {
        Ok(Some(row)) => {
            if let Some(position) = row.into_iter().nth(1).flatten() {
                tracing::info!(snapshot = %position, "pinned server snapshot");
                config.snapshot = position;
            }
        }
        Ok(None) => tracing::warn!("cannot get snapshot: SHOW MASTER STATUS returned no rows"),
        Err(err) => tracing::warn!(error = %err, "cannot get snapshot from server"),
    }
}

/// Assembles the session parameters applied to every dump connection.
async fn apply_session_params(config: &mut DumpConfig, conn: &mut dyn SqlConn) -> Result<()> {
    if config.server_info.kind == ServerKind::Dsql {
        if let Some(quota) = config.tidb_mem_quota_query {
            config
                .session_params
                .insert("tidb_mem_quota_query".to_string(), quota.to_string());
        }
    }
    if config.snapshot.is_empty() {
        return Ok(());
    }
    if config.server_info.kind != ServerKind::Dsql {
        bail!("snapshot consistency is not supported by this server kind");
    }
    if config.consistency == ConsistencyMode::Snapshot {
        config.server_info.has_distributed_storage = check_distributed_storage(conn).await?;
        if config.server_info.has_distributed_storage {
            config
                .session_params
                .insert("tidb_snapshot".to_string(), config.snapshot.clone());
        }
    }
    Ok(())
}

async fn check_distributed_storage(conn: &mut dyn SqlConn) -> Result<bool> {
    let row = conn
        .query_row("SELECT COUNT(1) FROM mysql.tidb WHERE VARIABLE_NAME='tikv_gc_life_time'")
        .await
        .context("check distributed storage layer")?;
    Ok(row
        .and_then(|row| row.into_iter().next().flatten())
        .and_then(|text| text.parse::<u64>().ok())
        .unwrap_or(0)
        > 0)
}

/// Walks the selected tables in order: database meta, then per table its
/// schema task followed by its data chunks.
async fn dump_databases(
    config: &DumpConfig,
    chunker: &TableChunker<'_>,
    conn: &mut dyn SqlConn,
    tables: &DatabaseTables,
    sender: &TaskSender,
) -> Result<()> {
    for (database, infos) in tables {
        if !config.no_schemas {
            let create_sql = show_create_database(conn, database).await?;
            sender
                .send(Task::DatabaseMeta {
                    database: database.clone(),
                    create_sql,
                })
                .await?;
        }
        for info in infos {
            tracing::debug!(%database, table = %info.name, "start dumping table");
            let meta = dump_table_meta(config, conn, database, info).await?;
            match info.kind {
                TableKind::View => {
                    if !config.no_schemas && !config.no_views {
                        sender
                            .send(Task::ViewMeta {
                                database: database.clone(),
                                view: info.name.clone(),
                                create_table_sql: meta.create_table_ddl.clone().unwrap_or_default(),
                                create_view_sql: meta.create_view_ddl.clone().unwrap_or_default(),
                            })
                            .await?;
                    }
                }
                TableKind::Base => {
                    if !config.no_schemas {
                        sender
                            .send(Task::TableMeta {
                                database: database.clone(),
                                table: info.name.clone(),
                                create_sql: meta.create_table_ddl.clone().unwrap_or_default(),
                            })
                            .await?;
                    }
                    chunker.dump_table_data(conn, &meta, sender).await?;
                }
            }
        }
    }
    Ok(())
}
