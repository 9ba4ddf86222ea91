//! Dump configuration and normalization.
//!
//! `DumpConfig` is built by the CLI or programmatically, passed through
//! `adjust()` once, and treated as immutable afterwards (the init steps fill
//! in probed fields such as the server info and the resolved consistency).

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::server::ServerInfo;
use crate::sql::escape_string_value;

/// Consistency regime requested for the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Resolve by server kind: DSQL → snapshot, MySQL/MariaDB → flush, else none.
    Auto,
    /// `LOCK TABLES … READ` over every selected table.
    Lock,
    /// `FLUSH TABLES WITH READ LOCK`.
    Flush,
    /// Server-side MVCC snapshot applied per connection.
    Snapshot,
    /// No consistency guarantee.
    None,
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyMode::Auto => "auto",
            ConsistencyMode::Lock => "lock",
            ConsistencyMode::Flush => "flush",
            ConsistencyMode::Snapshot => "snapshot",
            ConsistencyMode::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for ConsistencyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ConsistencyMode::Auto),
            "lock" => Ok(ConsistencyMode::Lock),
            "flush" => Ok(ConsistencyMode::Flush),
            "snapshot" => Ok(ConsistencyMode::Snapshot),
            "none" => Ok(ConsistencyMode::None),
            other => bail!("unknown consistency mode {other:?}"),
        }
    }
}

/// `db.table` pattern with `*` wildcards in either segment.
#[derive(Debug, Clone)]
struct TablePattern {
    database: String,
    table: String,
}

impl TablePattern {
    fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('.') {
            Some((database, table)) if !database.is_empty() && !table.is_empty() => Ok(Self {
                database: database.to_string(),
                table: table.to_string(),
            }),
            _ => bail!("invalid table filter {raw:?}, expected db.table"),
        }
    }
}

/// Simple `*`-wildcard match; no character classes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut segments = pattern.split('*');
    let first = segments.next().unwrap_or("");
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];
    let mut last: Option<&str> = None;
    for segment in segments {
        last = Some(segment);
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    match last {
        // No '*' at all: the prefix match must have been exact.
        None => rest.is_empty(),
        Some(segment) => segment.is_empty() || rest.is_empty() || text.ends_with(segment),
    }
}

/// Include/exclude filter over `db.table` names.
#[derive(Debug, Clone)]
pub struct TableFilter {
    includes: Vec<TablePattern>,
    excludes: Vec<TablePattern>,
}

impl Default for TableFilter {
    fn default() -> Self {
        Self {
            includes: vec![TablePattern {
                database: "*".to_string(),
                table: "*".to_string(),
            }],
            excludes: Vec::new(),
        }
    }
}

impl TableFilter {
    /// Builds a filter from `db.table` patterns; a leading `!` excludes.
    pub fn parse(rules: &[String]) -> Result<Self> {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for rule in rules {
            if let Some(negated) = rule.strip_prefix('!') {
                excludes.push(TablePattern::parse(negated)?);
            } else {
                includes.push(TablePattern::parse(rule)?);
            }
        }
        if includes.is_empty() {
            includes.push(TablePattern {
                database: "*".to_string(),
                table: "*".to_string(),
            });
        }
        Ok(Self { includes, excludes })
    }

    pub fn matches(&self, database: &str, table: &str) -> bool {
        let included = self
            .includes
            .iter()
            .any(|p| glob_match(&p.database, database) && glob_match(&p.table, table));
        let excluded = self
            .excludes
            .iter()
            .any(|p| glob_match(&p.database, database) && glob_match(&p.table, table));
        included && !excluded
    }

    /// Whether any table of this database could match.
    pub fn matches_database(&self, database: &str) -> bool {
        self.includes
            .iter()
            .any(|p| glob_match(&p.database, database))
    }
}

/// Everything the dumper needs to know, fixed after `adjust()`.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Explicit database list; empty means discover all non-system schemas.
    pub databases: Vec<String>,
    pub consistency: ConsistencyMode,
    pub threads: usize,
    /// Target chunk size in rows; `None` disables chunking.
    pub rows: Option<u64>,
    /// User WHERE clause appended to every data select.
    pub where_clause: String,
    /// Raw SQL mode: dump the result of this statement and nothing else.
    pub sql: String,
    /// Opaque server snapshot handle; acquired automatically when empty.
    pub snapshot: String,
    pub no_data: bool,
    pub no_schemas: bool,
    pub no_views: bool,
    pub complete_insert: bool,
    pub transactional_consistency: bool,
    pub pos_after_connect: bool,
    pub tidb_mem_quota_query: Option<u64>,
    /// Extra session variables applied to every dump connection.
    pub session_params: BTreeMap<String, String>,
    pub filter: TableFilter,
    /// External store location; currently a local directory.
    pub output: PathBuf,
    pub status_addr: Option<SocketAddr>,
    /// Filled by the server probe during init.
    pub server_info: ServerInfo,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            databases: Vec::new(),
            consistency: ConsistencyMode::Auto,
            threads: 4,
            rows: None,
            where_clause: String::new(),
            sql: String::new(),
            snapshot: String::new(),
            no_data: false,
            no_schemas: false,
            no_views: false,
            complete_insert: false,
            transactional_consistency: true,
            pos_after_connect: false,
            tidb_mem_quota_query: None,
            session_params: BTreeMap::new(),
            filter: TableFilter::default(),
            output: PathBuf::from("./export"),
            status_addr: None,
            server_info: ServerInfo::default(),
        }
    }
}

impl DumpConfig {
    /// Normalizes and validates the configuration. Must be called once before
    /// constructing a dumper.
    pub fn adjust(&mut self) -> Result<()> {
        if self.threads == 0 {
            self.threads = 4;
        }
        if self.rows == Some(0) {
            bail!("--rows must be positive when set");
        }
        if !self.sql.is_empty() && !self.where_clause.is_empty() {
            bail!("can't specify both --sql and --where at the same time");
        }
        if !self.snapshot.is_empty()
            && !matches!(
                self.consistency,
                ConsistencyMode::Snapshot | ConsistencyMode::Auto
            )
        {
            bail!("--snapshot requires snapshot consistency");
        }
        Ok(())
    }

    /// Connection URL for the pool.
    pub fn dsn(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        )
    }

    /// `SET SESSION` statements applied to every fresh connection.
    pub fn session_setup_statements(&self) -> Vec<String> {
        self.session_params
            .iter()
            .map(|(name, value)| {
                // Numeric values pass through bare; everything else is quoted.
                if value.chars().all(|c| c.is_ascii_digit()) {
                    format!("SET SESSION {name} = {value}")
                } else {
                    format!("SET SESSION {name} = '{}'", escape_string_value(value))
                }
            })
            .collect()
    }
}
