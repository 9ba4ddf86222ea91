//! Table chunking: splitting each table into independently dumpable tasks.
//!
//! Strategy selection per table:
//! - chunking disabled → one whole-table chunk (on DSQL, region sub-selects
//!   concatenated into one logical chunk when possible),
//! - DSQL with sampling or region decode → region-handle boundaries,
//! - anything else → integer-key range split driven by MIN/MAX and an
//!   estimated row count.
//!
//! Range arithmetic is arbitrary precision because split keys may be
//! `UNSIGNED BIGINT` values beyond `i64`.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use num_bigint::BigInt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{
    get_partition_names, has_implicit_row_id, is_integer_type, order_by_clause,
    pickup_possible_field, primary_key_columns,
};
use crate::config::DumpConfig;
use crate::server::ServerKind;
use crate::sql::{quote_ident, quote_str, quote_table, SqlConn};
use crate::task::{ChunkSource, Task, TableMeta, TaskSender};

/// Chunk byte budget used to derive a per-table row target for concat builds.
const CONCAT_CHUNK_BYTES: u64 = 64 * 1024 * 1024;
/// Row target when the server reports no average row length.
const DEFAULT_CONCAT_ROWS: u64 = 200_000;
/// Marker preceding the row id in `tidb_decode_key` output.
const DECODED_ROW_ID_MARKER: &str = "_tidb_rowid=";
/// Prefix of row-region start keys in `SHOW TABLE … REGIONS` output.
const REGION_ROW_KEY_MARKER: &str = "r_";

/// How region handle boundaries are obtained for a DSQL table.
pub enum RegionLookup {
    /// Ask the server (`TIKV_REGION_STATUS` + `tidb_decode_key`).
    Standard,
    /// Pre-decoded handles per `(database, table)`, for servers too old to
    /// decode keys themselves.
    Precomputed(BTreeMap<(String, String), Vec<i64>>),
}

impl RegionLookup {
    async fn table_region_handles(
        &self,
        conn: &mut dyn SqlConn,
        database: &str,
        table: &str,
    ) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        match self {
            RegionLookup::Standard => select_table_region(conn, database, table).await,
            RegionLookup::Precomputed(handles) => {
                let (fields, _) = row_key_fields(conn, database, table, true).await?;
                let vals = handles
                    .get(&(database.to_string(), table.to_string()))
                    .map(|hs| hs.iter().map(|h| vec![h.to_string()]).collect())
                    .unwrap_or_default();
                Ok((fields, vals))
            }
        }
    }
}

/// Splits one table into data tasks and feeds them to the queue.
pub struct TableChunker<'a> {
    pub config: &'a DumpConfig,
    pub region_lookup: &'a RegionLookup,
    pub cancel: CancellationToken,
}

impl TableChunker<'_> {
    pub async fn dump_table_data(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
    ) -> Result<()> {
        if self.config.no_data {
            return Ok(());
        }
        match self.config.rows {
            None => self.sequential_dump(conn, meta, sender).await,
            Some(rows) => self.concurrent_dump(conn, meta, sender, rows).await,
        }
    }

    /// Chunking disabled: one task per table. On DSQL we still split by
    /// region server-side and concatenate the selects, which preserves
    /// region locality while producing a single logical chunk.
    async fn sequential_dump(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
    ) -> Result<()> {
        if self.config.server_info.kind == ServerKind::Dsql {
            if let Some(task) = self.build_concat_task(conn, meta).await? {
                return sender.send(task).await;
            }
            tracing::info!(
                database = %meta.database,
                table = %meta.table,
                "no region concat built, selecting whole table"
            );
        }
        self.dump_whole_table(conn, meta, sender, "", 0, 1).await
    }

    async fn dump_whole_table(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
        partition: &str,
        chunk_index: usize,
        total_chunks: usize,
    ) -> Result<()> {
        let order_by = order_by_clause(
            conn,
            self.config.server_info.kind,
            &meta.database,
            &meta.table,
        )
        .await?;
        let query = build_select_query(
            &meta.database,
            &meta.table,
            meta.select_field(),
            partition,
            &where_condition(self.config, ""),
            &order_by,
        );
        let task = Task::TableData {
            meta: meta.clone(),
            chunk: ChunkSource::SingleQuery {
                sql: query,
                column_count: meta.column_count,
                is_raw: false,
            },
            chunk_index,
            total_chunks,
        };
        sender.send(task).await
    }

    async fn concurrent_dump(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
        rows: u64,
    ) -> Result<()> {
        let server = &self.config.server_info;
        if server.supports_table_sample()
            || (server.has_distributed_storage && server.supports_region_decode())
        {
            return self.concurrent_dump_dsql(conn, meta, sender).await;
        }

        let database = &meta.database;
        let table = &meta.table;
        let Some(field) = pickup_possible_field(conn, database, table).await? else {
            tracing::warn!(%database, %table, "no splittable field, selecting whole table");
            return self.dump_whole_table(conn, meta, sender, "", 0, 1).await;
        };

        let Some((min, max)) = select_min_max(conn, self.config, database, table, &field).await?
        else {
            tracing::warn!(%database, %table, "no data to dump under current filter");
            return Ok(());
        };
        tracing::debug!(lower = %min, upper = %max, "integer bounding values");

        let count = estimate_count(conn, self.config, database, table, &field).await;
        tracing::info!(%database, %table, estimated_rows = count, "estimated rows count");
        if count < rows {
            tracing::warn!(
                %database,
                %table,
                estimated_rows = count,
                chunk_rows = rows,
                "estimate below chunk size, selecting whole table"
            );
            return self.dump_whole_table(conn, meta, sender, "", 0, 1).await;
        }

        let estimated_chunks = count / rows;
        let delta = &max - &min;
        let step = &delta / BigInt::from(estimated_chunks) + 1;
        let total_big = if step == BigInt::from(1) {
            &delta + 1
        } else {
            BigInt::from(estimated_chunks)
        };
        let total_chunks = usize::try_from(u64::try_from(&total_big).map_err(|_| {
            anyhow::anyhow!("chunk count {total_big} for {database}.{table} out of range")
        })?)
        .context("chunk count exceeds platform size")?;

        let order_by = order_by_clause(conn, server.kind, database, table).await?;
        let quoted_field = quote_ident(&field);
        let mut null_condition = if self.config.where_clause.is_empty() {
            format!("{quoted_field} IS NULL OR ")
        } else {
            String::new()
        };

        let mut cutoff = min;
        let mut chunk_index = 0usize;
        while cutoff <= max {
            let next = &cutoff + &step;
            let chunk_where = format!(
                "{null_condition}({quoted_field} >= {cutoff} AND {quoted_field} < {next})"
            );
            null_condition.clear();
            let query = build_select_query(
                database,
                table,
                meta.select_field(),
                "",
                &where_condition(self.config, &chunk_where),
                &order_by,
            );
            let task = Task::TableData {
                meta: meta.clone(),
                chunk: ChunkSource::SingleQuery {
                    sql: query,
                    column_count: meta.column_count,
                    is_raw: false,
                },
                chunk_index,
                total_chunks,
            };
            sender.send(task).await?;
            cutoff = next;
            chunk_index += 1;
        }
        Ok(())
    }

    async fn concurrent_dump_dsql(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
    ) -> Result<()> {
        let database = &meta.database;
        let table = &meta.table;
        let (fields, vals) = if self.config.server_info.supports_table_sample() {
            tracing::debug!(%database, %table, "splitting by TABLESAMPLE REGIONS");
            select_table_sample(conn, database, table).await?
        } else {
            tracing::debug!(%database, %table, "splitting by table regions");
            let partitions = get_partition_names(conn, database, table).await?;
            if !partitions.is_empty() {
                return self
                    .concurrent_dump_dsql_partitions(conn, meta, sender, &partitions)
                    .await;
            }
            self.region_lookup
                .table_region_handles(conn, database, table)
                .await?
        };
        let total = vals.len() + 1;
        self.send_dsql_tasks(conn, meta, sender, &fields, &vals, "", 0, total)
            .await
    }

    async fn concurrent_dump_dsql_partitions(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
        partitions: &[String],
    ) -> Result<()> {
        let database = &meta.database;
        let table = &meta.table;
        tracing::debug!(%database, %table, ?partitions, "splitting partitioned table by regions");
        let (fields, _) = row_key_fields(conn, database, table, true).await?;

        // Handle lists are cached first so every task reports the final total.
        let mut cached = Vec::with_capacity(partitions.len());
        let mut total_chunks = 0usize;
        for partition in partitions {
            let vals =
                select_partition_region_handles(conn, database, table, partition).await?;
            total_chunks += vals.len() + 1;
            cached.push(vals);
        }

        let mut start_index = 0usize;
        for (partition, vals) in partitions.iter().zip(cached) {
            self.send_dsql_tasks(
                conn,
                meta,
                sender,
                &fields,
                &vals,
                partition,
                start_index,
                total_chunks,
            )
            .await?;
            start_index += vals.len() + 1;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_dsql_tasks(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
        sender: &TaskSender,
        fields: &[String],
        vals: &[Vec<String>],
        partition: &str,
        start_index: usize,
        total_chunks: usize,
    ) -> Result<()> {
        if vals.is_empty() {
            return self
                .dump_whole_table(conn, meta, sender, partition, start_index, total_chunks)
                .await;
        }
        let wheres = build_where_clauses(fields, vals);
        let order_by = order_by_fields(fields);
        for (i, chunk_where) in wheres.iter().enumerate() {
            let query = build_select_query(
                &meta.database,
                &meta.table,
                meta.select_field(),
                partition,
                &where_condition(self.config, chunk_where),
                &order_by,
            );
            let task = Task::TableData {
                meta: meta.clone(),
                chunk: ChunkSource::SingleQuery {
                    sql: query,
                    column_count: meta.column_count,
                    is_raw: false,
                },
                chunk_index: start_index + i,
                total_chunks,
            };
            sender.send(task).await?;
        }
        Ok(())
    }

    /// Runs the concurrent DSQL chunker into a local queue and merges the
    /// produced selects into one `MultiQuery` chunk. Returns `None` when the
    /// table yields at most one sub-chunk or the sub-chunks disagree on
    /// column count.
    async fn build_concat_task(
        &self,
        conn: &mut dyn SqlConn,
        meta: &TableMeta,
    ) -> Result<Option<Task>> {
        let rows = suitable_rows(conn, &meta.database, &meta.table).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = TaskSender::local(tx, self.cancel.clone());
        self.concurrent_dump(conn, meta, &local, rows).await?;
        drop(local);

        let mut queries = Vec::new();
        let mut column_count = None;
        while let Some(task) = rx.recv().await {
            let chunk = match task {
                Task::TableData { chunk, .. } => chunk,
                other => {
                    tracing::warn!(
                        task = %other.brief(),
                        "unexpected task while splitting table chunks"
                    );
                    continue;
                }
            };
            let ChunkSource::SingleQuery {
                sql,
                column_count: cols,
                ..
            } = chunk
            else {
                tracing::warn!("unexpected multi-query sub-chunk while splitting table chunks");
                continue;
            };
            match column_count {
                None => column_count = Some(cols),
                Some(expected) if expected != cols => {
                    tracing::warn!(
                        expected_columns = expected,
                        got_columns = cols,
                        first_query = %queries[0],
                        query = %sql,
                        "column count varies between chunks of one table, \
                         falling back to whole-table select"
                    );
                    return Ok(None);
                }
                Some(_) => {}
            }
            queries.push(sql);
        }
        if queries.len() <= 1 {
            return Ok(None);
        }
        Ok(Some(Task::TableData {
            meta: meta.clone(),
            chunk: ChunkSource::MultiQuery {
                sqls: queries,
                column_count: column_count.unwrap_or(meta.column_count),
            },
            chunk_index: 0,
            total_chunks: 1,
        }))
    }

    /// Raw-SQL mode: a single data task wrapping the user statement.
    pub async fn dump_raw_sql(&self, sender: &TaskSender) -> Result<()> {
        let task = Task::TableData {
            meta: TableMeta::default(),
            chunk: ChunkSource::SingleQuery {
                sql: self.config.sql.clone(),
                column_count: 0,
                is_raw: true,
            },
            chunk_index: 0,
            total_chunks: 1,
        };
        sender.send(task).await
    }
}

/// Row target for concat builds, derived from the table's average row length.
async fn suitable_rows(conn: &mut dyn SqlConn, database: &str, table: &str) -> u64 {
    let sql = format!(
        "SELECT AVG_ROW_LENGTH FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA={} AND TABLE_NAME={}",
        quote_str(database),
        quote_str(table)
    );
    match conn.query_row(&sql).await {
        Ok(Some(row)) => match row.first().and_then(|v| v.as_deref()).map(str::parse::<u64>) {
            Some(Ok(avg)) if avg > 0 => (CONCAT_CHUNK_BYTES / avg).max(1),
            _ => DEFAULT_CONCAT_ROWS,
        },
        _ => {
            tracing::debug!(%database, %table, "cannot read average row length");
            DEFAULT_CONCAT_ROWS
        }
    }
}

async fn select_min_max(
    conn: &mut dyn SqlConn,
    config: &DumpConfig,
    database: &str,
    table: &str,
    field: &str,
) -> Result<Option<(BigInt, BigInt)>> {
    let quoted = quote_ident(field);
    let mut sql = format!(
        "SELECT MIN({quoted}),MAX({quoted}) FROM {}",
        quote_table(database, table)
    );
    if !config.where_clause.is_empty() {
        sql.push_str(&format!(" WHERE {}", config.where_clause));
    }
    let row = conn
        .query_row(&sql)
        .await
        .with_context(|| format!("get min/max of {database}.{table}.{field}"))?;
    let (min_text, max_text) = match row {
        Some(row) => match (row.first().cloned().flatten(), row.get(1).cloned().flatten()) {
            (Some(min), Some(max)) => (min, max),
            _ => return Ok(None),
        },
        None => return Ok(None),
    };
    let min: BigInt = min_text
        .parse()
        .with_context(|| format!("parse MIN value {min_text:?} of {database}.{table}"))?;
    let max: BigInt = max_text
        .parse()
        .with_context(|| format!("parse MAX value {max_text:?} of {database}.{table}"))?;
    Ok(Some((min, max)))
}

/// Estimated row count from EXPLAIN; zero when the plan is unreadable.
async fn estimate_count(
    conn: &mut dyn SqlConn,
    config: &DumpConfig,
    database: &str,
    table: &str,
    field: &str,
) -> u64 {
    let mut sql = format!(
        "EXPLAIN SELECT {} FROM {}",
        quote_ident(field),
        quote_table(database, table)
    );
    if !config.where_clause.is_empty() {
        sql.push_str(&format!(" WHERE {}", config.where_clause));
    }
    let (columns, rows) = match conn.query_with_columns(&sql).await {
        Ok(result) => result,
        Err(err) => {
            tracing::debug!(%database, %table, error = %err, "estimate rows query failed");
            return 0;
        }
    };
    let Some(idx) = columns
        .iter()
        .position(|name| name.eq_ignore_ascii_case("rows") || name == "estRows")
    else {
        return 0;
    };
    for row in rows {
        if let Some(Some(value)) = row.get(idx) {
            if let Ok(estimate) = value.parse::<f64>() {
                return estimate as u64;
            }
        }
    }
    0
}

/// Row-key fields used as region boundaries: the implicit row id when the
/// table has one, else the primary key. With `check_region` the key must be
/// a single integer column.
pub(crate) async fn row_key_fields(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
    check_region: bool,
) -> Result<(Vec<String>, Vec<String>)> {
    if has_implicit_row_id(conn, database, table).await? {
        return Ok((vec!["_tidb_rowid".to_string()], vec!["BIGINT".to_string()]));
    }
    let pk = primary_key_columns(conn, database, table).await?;
    if pk.is_empty() {
        bail!("no primary key or implicit row id on {database}.{table}");
    }
    if check_region {
        if pk.len() != 1 {
            bail!(
                "unsupported composite primary key for region chunking on {database}.{table}"
            );
        }
        if !is_integer_type(&pk[0].1) {
            bail!(
                "unsupported primary key type {} for region chunking on {database}.{table}",
                pk[0].1
            );
        }
    }
    Ok(pk.into_iter().unzip())
}

async fn select_table_sample(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let (fields, _) = row_key_fields(conn, database, table, false).await?;
    let quoted = fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT {quoted} FROM {} TABLESAMPLE REGIONS() ORDER BY {quoted}",
        quote_table(database, table)
    );
    let rows = conn.query(&sql).await.context("sample table regions")?;
    let vals = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|v| v.unwrap_or_else(|| "NULL".to_string()))
                .collect()
        })
        .collect();
    Ok((fields, vals))
}

async fn select_table_region(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let (fields, _) = row_key_fields(conn, database, table, true).await?;
    let sql = format!(
        "SELECT START_KEY,tidb_decode_key(START_KEY) FROM INFORMATION_SCHEMA.TIKV_REGION_STATUS \
         WHERE DB_NAME={} AND TABLE_NAME={} AND IS_INDEX=0 ORDER BY START_KEY",
        quote_str(database),
        quote_str(table)
    );
    let rows = conn.query(&sql).await.context("list table regions")?;
    let mut vals = Vec::new();
    for (row_id, row) in rows.into_iter().enumerate() {
        // The first region's start key belongs to a neighbor table or is
        // unbounded, so it never contributes a boundary.
        if row_id == 0 {
            continue;
        }
        let (Some(Some(start_key)), Some(Some(decoded))) = (row.first(), row.get(1)) else {
            tracing::debug!(%database, %table, row_id, "invalid region start key");
            continue;
        };
        match extract_after(DECODED_ROW_ID_MARKER, decoded) {
            Ok(handle) => vals.push(vec![handle]),
            Err(err) => tracing::debug!(
                %database,
                %table,
                row_id,
                start_key = %start_key,
                error = %err,
                "no row id in decoded start key"
            ),
        }
    }
    Ok((fields, vals))
}

async fn select_partition_region_handles(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
    partition: &str,
) -> Result<Vec<Vec<String>>> {
    let sql = format!(
        "SHOW TABLE {} PARTITION({}) REGIONS",
        quote_table(database, table),
        quote_ident(partition)
    );
    let (columns, rows) = conn
        .query_with_columns(&sql)
        .await
        .context("show partition regions")?;
    let Some(idx) = columns.iter().position(|name| name == "START_KEY") else {
        bail!("SHOW TABLE REGIONS output has no START_KEY column");
    };
    let mut vals = Vec::new();
    for (row_id, row) in rows.into_iter().enumerate() {
        if row_id == 0 {
            continue;
        }
        let Some(Some(start_key)) = row.get(idx) else {
            continue;
        };
        match extract_after(REGION_ROW_KEY_MARKER, start_key) {
            Ok(handle) => vals.push(vec![handle]),
            Err(err) => tracing::debug!(
                %database,
                %table,
                %partition,
                row_id,
                start_key = %start_key,
                error = %err,
                "region start key has no row id"
            ),
        }
    }
    Ok(vals)
}

fn extract_after(marker: &str, key: &str) -> Result<String> {
    match key.find(marker) {
        Some(pos) => Ok(key[pos + marker.len()..].to_string()),
        None => bail!("decoded key {key:?} has no {marker:?} field"),
    }
}

/// Renders a boundary value: numerics stay bare, anything else is quoted.
fn sql_literal(value: &str) -> String {
    if value == "NULL" || value.parse::<f64>().is_ok() {
        value.to_string()
    } else {
        quote_str(value)
    }
}

/// Lexicographic `>=` comparison over a key prefix.
fn compare_ge(fields: &[String], vals: &[String]) -> String {
    let field = quote_ident(&fields[0]);
    if fields.len() == 1 {
        return format!("{field}>={}", sql_literal(&vals[0]));
    }
    format!(
        "{field}>{val} OR ({field}={val} AND ({rest}))",
        val = sql_literal(&vals[0]),
        rest = compare_ge(&fields[1..], &vals[1..])
    )
}

/// Lexicographic `<` comparison over a key prefix.
fn compare_lt(fields: &[String], vals: &[String]) -> String {
    let field = quote_ident(&fields[0]);
    if fields.len() == 1 {
        return format!("{field}<{}", sql_literal(&vals[0]));
    }
    format!(
        "{field}<{val} OR ({field}={val} AND ({rest}))",
        val = sql_literal(&vals[0]),
        rest = compare_lt(&fields[1..], &vals[1..])
    )
}

/// `n` sorted boundaries produce `n + 1` pairwise-disjoint WHERE clauses
/// covering the whole key space.
pub fn build_where_clauses(fields: &[String], vals: &[Vec<String>]) -> Vec<String> {
    let mut wheres = Vec::with_capacity(vals.len() + 1);
    let wrap = |clause: String| {
        if fields.len() == 1 {
            clause
        } else {
            format!("({clause})")
        }
    };
    wheres.push(wrap(compare_lt(fields, &vals[0])));
    for window in vals.windows(2) {
        wheres.push(format!(
            "{} AND {}",
            wrap(compare_ge(fields, &window[0])),
            wrap(compare_lt(fields, &window[1]))
        ));
    }
    wheres.push(wrap(compare_ge(fields, &vals[vals.len() - 1])));
    wheres
}

fn order_by_fields(fields: &[String]) -> String {
    let quoted = fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(",");
    format!("ORDER BY {quoted}")
}

/// Combines the user WHERE with a chunk WHERE. The user clause comes first,
/// matching the layout downstream loaders already parse.
pub fn where_condition(config: &DumpConfig, chunk_where: &str) -> String {
    match (config.where_clause.is_empty(), chunk_where.is_empty()) {
        (true, true) => String::new(),
        (true, false) => format!("WHERE {chunk_where}"),
        (false, true) => format!("WHERE {}", config.where_clause),
        (false, false) => format!("WHERE {} AND {chunk_where}", config.where_clause),
    }
}

/// Assembles a data select statement.
pub fn build_select_query(
    database: &str,
    table: &str,
    field: &str,
    partition: &str,
    where_cond: &str,
    order_by: &str,
) -> String {
    let mut query = format!("SELECT {field} FROM {}", quote_table(database, table));
    if !partition.is_empty() {
        query.push_str(&format!(" PARTITION({})", quote_ident(partition)));
    }
    if !where_cond.is_empty() {
        query.push(' ');
        query.push_str(where_cond);
    }
    if !order_by.is_empty() {
        query.push(' ');
        query.push_str(order_by);
    }
    query
}
