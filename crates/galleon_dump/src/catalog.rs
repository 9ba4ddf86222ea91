//! Catalog enumeration and schema introspection.
//!
//! Everything here runs on the metadata connection inside the active
//! consistency regime, so the table list and DDL reflect one catalog state.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::DumpConfig;
use crate::server::ServerKind;
use crate::sql::{quote_ident, quote_str, quote_table, SqlConn};
use crate::task::TableMeta;

/// Schemas never dumped.
const SYSTEM_SCHEMAS: &[&str] = &[
    "information_schema",
    "performance_schema",
    "mysql",
    "sys",
    "metrics_schema",
    "inspection_schema",
];

/// Kind of relation, as reported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Base,
    View,
}

/// One selected relation within a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub kind: TableKind,
}

/// Selected tables, keyed by database. Within a database the order is the
/// enumeration order: base tables first, then views, each alphabetical.
pub type DatabaseTables = BTreeMap<String, Vec<TableInfo>>;

fn is_system_schema(name: &str) -> bool {
    SYSTEM_SCHEMAS
        .iter()
        .any(|schema| schema.eq_ignore_ascii_case(name))
}

async fn list_databases(conn: &mut dyn SqlConn, config: &DumpConfig) -> Result<Vec<String>> {
    if !config.databases.is_empty() {
        return Ok(config.databases.clone());
    }
    let all = conn
        .query_strings("SHOW DATABASES")
        .await
        .context("list databases")?;
    Ok(all
        .into_iter()
        .filter(|db| !is_system_schema(db) && config.filter.matches_database(db))
        .collect())
}

/// Enumerates the relations to dump, applying the configured filter.
/// Views are merged after base tables unless views are disabled.
pub async fn prepare_table_list(
    conn: &mut dyn SqlConn,
    config: &DumpConfig,
) -> Result<DatabaseTables> {
    let databases = list_databases(conn, config).await?;
    if databases.is_empty() {
        bail!("no database to dump after applying filters");
    }

    let db_list = databases
        .iter()
        .map(|db| quote_str(db))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT TABLE_SCHEMA,TABLE_NAME,TABLE_TYPE FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA IN ({db_list}) ORDER BY TABLE_SCHEMA,TABLE_NAME"
    );
    let rows = conn.query(&sql).await.context("list tables")?;

    let mut tables: DatabaseTables = databases
        .iter()
        .map(|db| (db.clone(), Vec::new()))
        .collect();
    let mut views: DatabaseTables = BTreeMap::new();
    for row in rows {
        let (db, name, kind) = match (row.first(), row.get(1), row.get(2)) {
            (Some(Some(db)), Some(Some(name)), Some(Some(kind))) => (db, name, kind),
            _ => bail!("unexpected NULL in INFORMATION_SCHEMA.TABLES row"),
        };
        if !config.filter.matches(db, name) {
            continue;
        }
        let info = |kind| TableInfo {
            name: name.clone(),
            kind,
        };
        if kind.eq_ignore_ascii_case("VIEW") {
            if !config.no_views {
                views.entry(db.clone()).or_default().push(info(TableKind::View));
            }
        } else {
            tables
                .entry(db.clone())
                .or_default()
                .push(info(TableKind::Base));
        }
    }
    for (db, mut list) in views {
        tables.entry(db).or_default().append(&mut list);
    }
    Ok(tables)
}

/// Builds the explicit column list for SELECTs.
///
/// Returns `("", n)` when all `n` columns can be selected with `*`, which is
/// the case unless `complete_insert` forces an explicit list or generated
/// columns must be skipped.
pub async fn build_select_field(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
    complete_insert: bool,
) -> Result<(String, usize)> {
    let sql = format!(
        "SELECT COLUMN_NAME,EXTRA FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA={} AND TABLE_NAME={} ORDER BY ORDINAL_POSITION",
        quote_str(database),
        quote_str(table)
    );
    let rows = conn
        .query(&sql)
        .await
        .with_context(|| format!("list columns of {database}.{table}"))?;
    let mut names = Vec::with_capacity(rows.len());
    let mut has_generated = false;
    for row in &rows {
        let name = row
            .first()
            .and_then(|v| v.as_deref())
            .ok_or_else(|| anyhow!("NULL column name in {database}.{table}"))?;
        let extra = row.get(1).and_then(|v| v.as_deref()).unwrap_or("");
        if extra.contains("GENERATED") {
            has_generated = true;
        } else {
            names.push(quote_ident(name));
        }
    }
    if !complete_insert && !has_generated {
        return Ok((String::new(), rows.len()));
    }
    let count = names.len();
    Ok((names.join(","), count))
}

/// Primary-key columns with their data types, in key order.
pub async fn primary_key_columns(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<Vec<(String, String)>> {
    let sql = format!(
        "SELECT COLUMN_NAME,DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA={} AND TABLE_NAME={} AND COLUMN_KEY='PRI' ORDER BY ORDINAL_POSITION",
        quote_str(database),
        quote_str(table)
    );
    let rows = conn.query(&sql).await.context("list primary key columns")?;
    rows.into_iter()
        .map(|row| match (row.first(), row.get(1)) {
            (Some(Some(name)), Some(Some(data_type))) => Ok((name.clone(), data_type.clone())),
            _ => bail!("unexpected NULL primary key column in {database}.{table}"),
        })
        .collect()
}

/// Integer column types eligible as chunk split keys.
pub fn is_integer_type(data_type: &str) -> bool {
    matches!(
        data_type.to_ascii_lowercase().as_str(),
        "int" | "integer" | "bigint" | "smallint" | "mediumint" | "tinyint"
    )
}

/// Whether the table carries the implicit DSQL row-id column.
pub async fn has_implicit_row_id(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<bool> {
    let sql = format!(
        "SELECT _tidb_rowid FROM {} LIMIT 0",
        quote_table(database, table)
    );
    match conn.query(&sql).await {
        Ok(_) => Ok(true),
        Err(err) => {
            let message = err.to_string().to_ascii_lowercase();
            if message.contains("unknown column") {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

/// Picks the column used for integer-range chunking: a single-column integer
/// primary key, else a single-column integer unique key, else nothing.
pub async fn pickup_possible_field(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<Option<String>> {
    let pk = primary_key_columns(conn, database, table).await?;
    if pk.len() == 1 && is_integer_type(&pk[0].1) {
        return Ok(Some(pk[0].0.clone()));
    }
    if !pk.is_empty() {
        return Ok(None);
    }
    let sql = format!(
        "SELECT COLUMN_NAME,DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA={} AND TABLE_NAME={} AND COLUMN_KEY='UNI' ORDER BY ORDINAL_POSITION",
        quote_str(database),
        quote_str(table)
    );
    let rows = conn.query(&sql).await.context("list unique key columns")?;
    for row in rows {
        if let (Some(Some(name)), Some(Some(data_type))) = (row.first(), row.get(1)) {
            if is_integer_type(data_type) {
                return Ok(Some(name.clone()));
            }
        }
    }
    Ok(None)
}

/// ORDER BY clause for data selects: implicit row id on DSQL when present,
/// else the primary key, else nothing.
pub async fn order_by_clause(
    conn: &mut dyn SqlConn,
    server_kind: ServerKind,
    database: &str,
    table: &str,
) -> Result<String> {
    if server_kind == ServerKind::Dsql && has_implicit_row_id(conn, database, table).await? {
        return Ok("ORDER BY `_tidb_rowid`".to_string());
    }
    let pk = primary_key_columns(conn, database, table).await?;
    if pk.is_empty() {
        return Ok(String::new());
    }
    let cols = pk
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(",");
    Ok(format!("ORDER BY {cols}"))
}

/// Partition names of a table, empty when unpartitioned.
pub async fn get_partition_names(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT PARTITION_NAME FROM INFORMATION_SCHEMA.PARTITIONS \
         WHERE TABLE_SCHEMA={} AND TABLE_NAME={}",
        quote_str(database),
        quote_str(table)
    );
    let rows = conn.query(&sql).await.context("list partitions")?;
    Ok(rows
        .into_iter()
        .filter_map(|mut row| {
            if row.is_empty() {
                None
            } else {
                row.swap_remove(0)
            }
        })
        .collect())
}

pub async fn show_create_database(conn: &mut dyn SqlConn, database: &str) -> Result<String> {
    let sql = format!("SHOW CREATE DATABASE {}", quote_ident(database));
    let row = conn
        .query_row(&sql)
        .await?
        .ok_or_else(|| anyhow!("empty SHOW CREATE DATABASE result for {database}"))?;
    row.get(1)
        .and_then(|v| v.clone())
        .ok_or_else(|| anyhow!("NULL create statement for database {database}"))
}

pub async fn show_create_table(
    conn: &mut dyn SqlConn,
    database: &str,
    table: &str,
) -> Result<String> {
    let sql = format!("SHOW CREATE TABLE {}", quote_table(database, table));
    let row = conn
        .query_row(&sql)
        .await?
        .ok_or_else(|| anyhow!("empty SHOW CREATE TABLE result for {database}.{table}"))?;
    row.get(1)
        .and_then(|v| v.clone())
        .ok_or_else(|| anyhow!("NULL create statement for table {database}.{table}"))
}

/// Returns `(create_table_sql, create_view_sql)` for a view. Downstream
/// loaders want a placeholder table definition first, so one is synthesized
/// from the view's field list.
pub async fn show_create_view(
    conn: &mut dyn SqlConn,
    database: &str,
    view: &str,
) -> Result<(String, String)> {
    let fields_sql = format!("SHOW FIELDS FROM {}", quote_table(database, view));
    let fields = conn.query(&fields_sql).await.context("show view fields")?;
    let mut placeholder = format!("CREATE TABLE {} (", quote_ident(view));
    let mut first = true;
    for row in &fields {
        if let Some(Some(name)) = row.first() {
            if !first {
                placeholder.push(',');
            }
            first = false;
            placeholder.push_str(&format!("{} int", quote_ident(name)));
        }
    }
    placeholder.push_str(") ENGINE=MyISAM;");

    let view_sql = format!("SHOW CREATE VIEW {}", quote_table(database, view));
    let row = conn
        .query_row(&view_sql)
        .await?
        .ok_or_else(|| anyhow!("empty SHOW CREATE VIEW result for {database}.{view}"))?;
    let create_view = row
        .get(1)
        .and_then(|v| v.clone())
        .ok_or_else(|| anyhow!("NULL create statement for view {database}.{view}"))?;
    Ok((placeholder, create_view))
}

/// Collects the per-table metadata emitted ahead of data chunks.
pub async fn dump_table_meta(
    config: &DumpConfig,
    conn: &mut dyn SqlConn,
    database: &str,
    table: &TableInfo,
) -> Result<TableMeta> {
    let (selected_field, column_count) =
        build_select_field(conn, database, &table.name, config.complete_insert).await?;
    let mut meta = TableMeta {
        database: database.to_string(),
        table: table.name.clone(),
        column_count,
        selected_field,
        create_table_ddl: None,
        create_view_ddl: None,
        leading_comments: vec!["/*!40101 SET NAMES binary*/;".to_string()],
    };
    if config.no_schemas {
        return Ok(meta);
    }
    match table.kind {
        TableKind::View => {
            let (create_table, create_view) =
                show_create_view(conn, database, &table.name).await?;
            meta.create_table_ddl = Some(create_table);
            meta.create_view_ddl = Some(create_view);
        }
        TableKind::Base => {
            meta.create_table_ddl = Some(show_create_table(conn, database, &table.name).await?);
        }
    }
    Ok(meta)
}
