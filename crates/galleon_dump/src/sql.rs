//! SQL execution seam and the production sqlx/MySQL adapter.
//!
//! Every query the orchestrator issues goes through `SqlConn`, which exposes
//! the MySQL text-protocol view of a result set (rows of optional strings).
//! Tests substitute a scripted fake; production wraps a `sqlx` pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection, MySql, Row, TypeInfo, ValueRef};

/// One result row as text-protocol values; `None` is SQL NULL.
pub type SqlRow = Vec<Option<String>>;

/// A single database connection.
#[async_trait]
pub trait SqlConn: Send {
    /// Runs a statement, discarding any result set.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Runs a query, returning column names and all rows as text values.
    async fn query_with_columns(&mut self, sql: &str) -> Result<(Vec<String>, Vec<SqlRow>)>;

    /// Liveness probe for the underlying connection.
    async fn ping(&mut self) -> Result<()>;

    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>> {
        Ok(self.query_with_columns(sql).await?.1)
    }

    /// First row, or `None` when the query matched nothing.
    async fn query_row(&mut self, sql: &str) -> Result<Option<SqlRow>> {
        Ok(self.query(sql).await?.into_iter().next())
    }

    /// First column of every row, NULLs skipped.
    async fn query_strings(&mut self, sql: &str) -> Result<Vec<String>> {
        Ok(self
            .query(sql)
            .await?
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
}

/// Hands out connections; the dump holds one pool for its whole lifetime.
#[async_trait]
pub trait SqlPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SqlConn>>;
}

/// Production pool backed by sqlx.
pub struct MySqlPoolAdapter {
    pool: MySqlPool,
}

impl MySqlPoolAdapter {
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .context("open MySQL connection pool")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SqlPool for MySqlPoolAdapter {
    async fn acquire(&self) -> Result<Box<dyn SqlConn>> {
        let conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection from pool")?;
        Ok(Box::new(MySqlConnAdapter { conn }))
    }
}

struct MySqlConnAdapter {
    conn: PoolConnection<MySql>,
}

#[async_trait]
impl SqlConn for MySqlConnAdapter {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("execute `{sql}`"))?;
        Ok(())
    }

    async fn query_with_columns(&mut self, sql: &str) -> Result<(Vec<String>, Vec<SqlRow>)> {
        let rows: Vec<MySqlRow> = sqlx::query(sql)
            .fetch_all(&mut *self.conn)
            .await
            .with_context(|| format!("query `{sql}`"))?;
        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|column| column.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.columns().len());
            for idx in 0..row.columns().len() {
                values.push(render_text(row, idx)?);
            }
            out.push(values);
        }
        Ok((columns, out))
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await.context("ping connection")
    }
}

/// Renders one column value the way the text protocol would.
fn render_text(row: &MySqlRow, idx: usize) -> Result<Option<String>> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(None);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    if let Some(text) = render_typed(row, idx, &type_name) {
        return Ok(Some(text));
    }
    if let Ok(text) = row.try_get::<String, _>(idx) {
        return Ok(Some(text));
    }
    let bytes: Vec<u8> = row
        .try_get(idx)
        .with_context(|| format!("render column {idx} of type {type_name} as text"))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn render_typed(row: &MySqlRow, idx: usize, type_name: &str) -> Option<String> {
    if type_name.contains("INT") {
        if type_name.contains("UNSIGNED") {
            return row.try_get::<u64, _>(idx).ok().map(|v| v.to_string());
        }
        return row.try_get::<i64, _>(idx).ok().map(|v| v.to_string());
    }
    match type_name {
        "FLOAT" => row.try_get::<f32, _>(idx).ok().map(|v| v.to_string()),
        "DOUBLE" => row.try_get::<f64, _>(idx).ok().map(|v| v.to_string()),
        "DECIMAL" => row
            .try_get::<sqlx::types::BigDecimal, _>(idx)
            .ok()
            .map(|v| v.to_string()),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .ok()
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .ok()
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .ok()
            .map(|v| v.format("%Y-%m-%d").to_string()),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .ok()
            .map(|v| v.format("%H:%M:%S%.f").to_string()),
        "JSON" => row
            .try_get::<serde_json::Value, _>(idx)
            .ok()
            .map(|v| v.to_string()),
        _ => None,
    }
}

/// Escapes an identifier for use inside backquotes.
pub fn escape_ident(ident: &str) -> String {
    ident.replace('`', "``")
}

/// Backquotes an identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", escape_ident(ident))
}

/// Backquoted `db`.`table` reference.
pub fn quote_table(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}

/// Escapes a value for a single-quoted SQL string literal.
pub fn escape_string_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// Single-quoted SQL string literal.
pub fn quote_str(value: &str) -> String {
    format!("'{}'", escape_string_value(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents_escape_backquotes() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
        assert_eq!(quote_table("d", "t"), "`d`.`t`");
    }

    #[test]
    fn string_literals_escape_quotes_and_backslashes() {
        assert_eq!(quote_str("it's"), "'it''s'");
        assert_eq!(quote_str(r"a\b"), r"'a\\b'");
    }
}
