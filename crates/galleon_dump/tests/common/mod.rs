//! Shared fakes for integration tests: a scripted SQL server, an in-memory
//! blob store, a task-recording sink, and a counting coordinator.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use galleon_dump::metrics::DumpMetrics;
use galleon_dump::safepoint::CoordinatorClient;
use galleon_dump::sql::{SqlConn, SqlPool, SqlRow};
use galleon_dump::storage::ExternalStorage;
use galleon_dump::task::{ChunkSource, Task, TableMeta, TaskSender};
use galleon_dump::worker::TaskSink;

#[derive(Clone)]
struct Rule {
    columns: Vec<String>,
    rows: Vec<SqlRow>,
    error: Option<String>,
}

/// Scripted MySQL-protocol server: exact-match query rules plus an execution
/// log. Unregistered queries fail loudly so tests catch drifting SQL.
#[derive(Default)]
pub struct FakeServer {
    rules: Mutex<BTreeMap<String, Rule>>,
    executed: Mutex<Vec<String>>,
    /// Per-statement counters of remaining injected failures.
    failures: Mutex<BTreeMap<String, usize>>,
    ping_fails: AtomicBool,
}

pub fn row(values: &[Option<&str>]) -> SqlRow {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

pub fn rows(values: &[&[Option<&str>]]) -> Vec<SqlRow> {
    values.iter().map(|v| row(v)).collect()
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, sql: &str, result_rows: Vec<SqlRow>) {
        self.on_with_columns(sql, &[], result_rows);
    }

    pub fn on_with_columns(&self, sql: &str, columns: &[&str], result_rows: Vec<SqlRow>) {
        self.rules.lock().unwrap().insert(
            sql.to_string(),
            Rule {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: result_rows,
                error: None,
            },
        );
    }

    pub fn on_error(&self, sql: &str, message: &str) {
        self.rules.lock().unwrap().insert(
            sql.to_string(),
            Rule {
                columns: Vec::new(),
                rows: Vec::new(),
                error: Some(message.to_string()),
            },
        );
    }

    /// The next `count` runs of `sql` fail with a connection-style error.
    pub fn fail_times(&self, sql: &str, count: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(sql.to_string(), count);
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_count(&self, sql: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    fn record(&self, sql: &str) {
        self.executed.lock().unwrap().push(sql.to_string());
    }

    fn take_failure(&self, sql: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(sql) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn lookup(&self, sql: &str) -> Result<(Vec<String>, Vec<SqlRow>)> {
        self.record(sql);
        if self.take_failure(sql) {
            bail!("connection reset while running `{sql}`");
        }
        let rules = self.rules.lock().unwrap();
        match rules.get(sql) {
            Some(rule) => match &rule.error {
                Some(message) => Err(anyhow!("{message}")),
                None => Ok((rule.columns.clone(), rule.rows.clone())),
            },
            None => Err(anyhow!("unexpected query: {sql}")),
        }
    }

    fn run(&self, sql: &str) -> Result<()> {
        self.record(sql);
        if self.take_failure(sql) {
            bail!("connection reset while running `{sql}`");
        }
        if let Some(rule) = self.rules.lock().unwrap().get(sql) {
            if let Some(message) = &rule.error {
                bail!("{message}");
            }
        }
        Ok(())
    }
}

pub struct FakeConn {
    server: Arc<FakeServer>,
}

#[async_trait]
impl SqlConn for FakeConn {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.server.run(sql)
    }

    async fn query_with_columns(&mut self, sql: &str) -> Result<(Vec<String>, Vec<SqlRow>)> {
        self.server.lookup(sql)
    }

    async fn ping(&mut self) -> Result<()> {
        if self.server.ping_fails.load(Ordering::SeqCst) {
            bail!("lock connection is gone");
        }
        Ok(())
    }
}

pub struct FakePool {
    pub server: Arc<FakeServer>,
}

#[async_trait]
impl SqlPool for FakePool {
    async fn acquire(&self) -> Result<Box<dyn SqlConn>> {
        Ok(Box::new(FakeConn {
            server: self.server.clone(),
        }))
    }
}

pub fn fake_conn(server: &Arc<FakeServer>) -> Box<dyn SqlConn> {
    Box::new(FakeConn {
        server: server.clone(),
    })
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemStorage {
    artifacts: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn artifact(&self, name: &str) -> Option<String> {
        self.artifacts
            .lock()
            .unwrap()
            .get(name)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn names(&self) -> Vec<String> {
        self.artifacts.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ExternalStorage for MemStorage {
    async fn write_artifact(&self, name: &str, data: &[u8]) -> Result<()> {
        self.artifacts
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

/// What the sink observed, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    DatabaseMeta(String),
    TableMeta(String, String),
    ViewMeta(String, String),
    TableData {
        database: String,
        table: String,
        chunk_index: usize,
        queries: Vec<String>,
    },
}

/// Sink that records events and executes chunk queries on the worker's
/// connection, like the real serializer would.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskSink for CollectSink {
    async fn write_database_meta(&self, database: &str, _create_sql: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::DatabaseMeta(database.to_string()));
        Ok(())
    }

    async fn write_table_meta(
        &self,
        database: &str,
        table: &str,
        _create_sql: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::TableMeta(database.to_string(), table.to_string()));
        Ok(())
    }

    async fn write_view_meta(
        &self,
        database: &str,
        view: &str,
        _create_table_sql: &str,
        _create_view_sql: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::ViewMeta(database.to_string(), view.to_string()));
        Ok(())
    }

    async fn write_table_data(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        chunk: &ChunkSource,
        chunk_index: usize,
    ) -> Result<u64> {
        let mut rows_read = 0u64;
        for query in chunk.queries() {
            rows_read += conn.query(query).await?.len() as u64;
        }
        self.events.lock().unwrap().push(SinkEvent::TableData {
            database: meta.database.clone(),
            table: meta.table.clone(),
            chunk_index,
            queries: chunk.queries().iter().map(|q| q.to_string()).collect(),
        });
        Ok(rows_read)
    }
}

/// Coordinator fake counting safepoint updates, optionally failing first.
#[derive(Default)]
pub struct FakeCoordinator {
    pub calls: AtomicUsize,
    pub successes: AtomicUsize,
    fail_first: AtomicUsize,
}

impl FakeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_first(&self, count: usize) {
        self.fail_first.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinatorClient for FakeCoordinator {
    async fn update_service_safe_point(
        &self,
        _service_id: &str,
        _ttl_secs: i64,
        safepoint_ts: u64,
    ) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            bail!("coordinator unavailable");
        }
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(safepoint_ts)
    }
}

/// A task queue pair for driving chunkers directly. Size the capacity above
/// the expected task count so producers never block in tests.
pub fn task_channel(
    capacity: usize,
) -> (TaskSender, tokio::sync::mpsc::Receiver<Task>) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    let sender = TaskSender::new(
        tx,
        tokio_util::sync::CancellationToken::new(),
        Arc::new(DumpMetrics::default()),
    );
    (sender, rx)
}

pub fn drain(rx: &mut tokio::sync::mpsc::Receiver<Task>) -> Vec<Task> {
    let mut tasks = Vec::new();
    while let Ok(task) = rx.try_recv() {
        tasks.push(task);
    }
    tasks
}
