//! Consistency regimes: how the dump sees one logical point in time.
//!
//! Lifecycle: built once the table list is known (the lock regime needs it
//! for its LOCK statement), `setup()` before any metadata or data is read,
//! `tear_down()` on every exit path. The lock-holding connection must stay
//! alive for the whole window; workers probe it through `ping()` before
//! rebuilding a broken data connection.

use anyhow::{Context, Result};

use crate::catalog::{DatabaseTables, TableKind};
use crate::config::{ConsistencyMode, DumpConfig};
use crate::server::ServerKind;
use crate::sql::{quote_table, SqlConn, SqlPool};

/// Controller over the active regime. The `Flush` and `Lock` variants own
/// the connection holding the server-side lock.
pub enum ConsistencyController {
    None,
    Snapshot,
    Flush {
        conn: Option<Box<dyn SqlConn>>,
    },
    Lock {
        conn: Option<Box<dyn SqlConn>>,
        lock_sql: String,
    },
}

impl ConsistencyController {
    /// Builds the controller for the resolved mode. `tables` must already be
    /// enumerated when the mode is `lock`.
    pub fn new(config: &DumpConfig, tables: &DatabaseTables) -> Result<Self> {
        match config.consistency {
            ConsistencyMode::None => Ok(ConsistencyController::None),
            ConsistencyMode::Snapshot => Ok(ConsistencyController::Snapshot),
            ConsistencyMode::Flush => Ok(ConsistencyController::Flush { conn: None }),
            ConsistencyMode::Lock => Ok(ConsistencyController::Lock {
                conn: None,
                lock_sql: build_lock_tables_sql(tables),
            }),
            ConsistencyMode::Auto => {
                anyhow::bail!("auto consistency must be resolved before building the controller")
            }
        }
    }

    pub async fn setup(&mut self, pool: &dyn SqlPool) -> Result<()> {
        match self {
            ConsistencyController::None | ConsistencyController::Snapshot => Ok(()),
            ConsistencyController::Flush { conn } => {
                let mut flush_conn = pool.acquire().await?;
                flush_conn
                    .execute("FLUSH TABLES WITH READ LOCK")
                    .await
                    .context("flush tables with read lock")?;
                *conn = Some(flush_conn);
                Ok(())
            }
            ConsistencyController::Lock { conn, lock_sql } => {
                let mut lock_conn = pool.acquire().await?;
                lock_conn
                    .execute(lock_sql)
                    .await
                    .context("lock selected tables")?;
                *conn = Some(lock_conn);
                Ok(())
            }
        }
    }

    /// Releases the server-side lock. Safe to call more than once; only the
    /// first call after `setup` does anything.
    pub async fn tear_down(&mut self) -> Result<()> {
        let conn = match self {
            ConsistencyController::Flush { conn } | ConsistencyController::Lock { conn, .. } => {
                conn
            }
            _ => return Ok(()),
        };
        if let Some(mut lock_conn) = conn.take() {
            lock_conn
                .execute("UNLOCK TABLES")
                .await
                .context("unlock tables")?;
        }
        Ok(())
    }

    /// Verifies the lock-holding connection is still alive.
    pub async fn ping(&mut self) -> Result<()> {
        match self {
            ConsistencyController::Flush { conn: Some(conn) }
            | ConsistencyController::Lock {
                conn: Some(conn), ..
            } => conn.ping().await.context("lock connection lost"),
            _ => Ok(()),
        }
    }
}

fn build_lock_tables_sql(tables: &DatabaseTables) -> String {
    let mut refs = Vec::new();
    for (database, infos) in tables {
        for info in infos {
            if info.kind == TableKind::Base {
                refs.push(format!("{} READ", quote_table(database, &info.name)));
            }
        }
    }
    format!("LOCK TABLES {}", refs.join(","))
}

/// Resolves `auto` by server kind.
pub fn resolve_auto_consistency(mode: ConsistencyMode, kind: ServerKind) -> ConsistencyMode {
    if mode != ConsistencyMode::Auto {
        return mode;
    }
    match kind {
        ServerKind::Dsql => ConsistencyMode::Snapshot,
        ServerKind::MySql | ServerKind::MariaDb => ConsistencyMode::Flush,
        ServerKind::Unknown => ConsistencyMode::None,
    }
}

/// Whether a worker may replace a broken data connection without breaking
/// the regime's guarantees.
pub fn can_rebuild_conn(mode: ConsistencyMode, transactional_only: bool) -> bool {
    match mode {
        ConsistencyMode::Lock | ConsistencyMode::Flush => !transactional_only,
        ConsistencyMode::Snapshot | ConsistencyMode::None => true,
        ConsistencyMode::Auto => false,
    }
}

/// Draws a connection and primes it for the active regime, so every worker
/// observes the same logical point in time.
pub async fn create_conn_with_consistency(
    pool: &dyn SqlPool,
    config: &DumpConfig,
) -> Result<Box<dyn SqlConn>> {
    let mut conn = pool.acquire().await?;
    for statement in config.session_setup_statements() {
        conn.execute(&statement)
            .await
            .with_context(|| format!("apply session parameter `{statement}`"))?;
    }
    if matches!(
        config.consistency,
        ConsistencyMode::Flush | ConsistencyMode::Lock
    ) {
        conn.execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .context("set repeatable read isolation")?;
        conn.execute("START TRANSACTION /*!40108 WITH CONSISTENT SNAPSHOT */")
            .await
            .context("start consistent snapshot transaction")?;
    }
    Ok(conn)
}
