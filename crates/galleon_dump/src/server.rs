//! Server probe: classify the remote server and derive capability flags.
//!
//! The probe runs once at startup from `SELECT version()`. Everything the
//! chunker and the consistency layer branch on later is a pure function of
//! the resulting `ServerInfo`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use semver::Version;

/// Kind of MySQL-protocol server on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    MySql,
    MariaDb,
    /// Distributed SQL engine (TiDB-compatible surface).
    Dsql,
    Unknown,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerKind::MySql => "MySQL",
            ServerKind::MariaDb => "MariaDB",
            ServerKind::Dsql => "DSQL",
            ServerKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// What the probe learned about the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub kind: ServerKind,
    pub version: Option<Version>,
    /// Whether a distributed storage layer (region-sharded) backs the server.
    /// Detected lazily during session setup; defaults to false.
    pub has_distributed_storage: bool,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            kind: ServerKind::Unknown,
            version: None,
            has_distributed_storage: false,
        }
    }
}

fn dsql_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)tidb-v?(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?)").expect("dsql version regex"))
}

fn mariadb_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+\.\d+\.\d+)-mariadb").expect("mariadb version regex"))
}

fn mysql_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+\.\d+\.\d+)").expect("mysql version regex"))
}

impl ServerInfo {
    /// Classifies a raw `SELECT version()` string.
    ///
    /// Examples seen in the wild: `8.0.18`, `5.5.5-10.4.8-MariaDB-log`,
    /// `5.7.25-TiDB-v4.0.0`.
    pub fn parse(version_text: &str) -> Self {
        let (kind, version) = if let Some(caps) = dsql_version_re().captures(version_text) {
            (ServerKind::Dsql, Version::parse(&caps[1]).ok())
        } else if let Some(caps) = mariadb_version_re().captures(version_text) {
            (ServerKind::MariaDb, Version::parse(&caps[1]).ok())
        } else if let Some(caps) = mysql_version_re().captures(version_text) {
            (ServerKind::MySql, Version::parse(&caps[1]).ok())
        } else {
            (ServerKind::Unknown, None)
        };
        if version.is_none() && kind != ServerKind::Unknown {
            tracing::warn!(version_text, %kind, "cannot parse server version");
        }
        Self {
            kind,
            version,
            has_distributed_storage: false,
        }
    }

    fn version_at_least(&self, threshold: &Version) -> bool {
        match &self.version {
            Some(version) => version >= threshold,
            None => false,
        }
    }

    /// `TABLESAMPLE REGIONS()` is available to split tables by region handle.
    pub fn supports_table_sample(&self) -> bool {
        self.kind == ServerKind::Dsql && self.version_at_least(table_sample_version())
    }

    /// Region start keys can be decoded server-side (`tidb_decode_key`) or,
    /// for the oldest supported versions, client-side from raw record keys.
    pub fn supports_region_decode(&self) -> bool {
        self.kind == ServerKind::Dsql && self.version_at_least(decode_region_version())
    }

    /// The placement coordinator honors service-scoped GC safepoints.
    pub fn supports_gc_safepoint(&self) -> bool {
        self.kind == ServerKind::Dsql && self.version_at_least(gc_safepoint_version())
    }
}

/// First DSQL version shipping `TABLESAMPLE REGIONS()`.
pub fn table_sample_version() -> &'static Version {
    static V: OnceLock<Version> = OnceLock::new();
    V.get_or_init(|| Version::parse("5.0.0-nightly").expect("table sample version"))
}

/// First DSQL version exposing region status with decodable keys.
pub fn decode_region_version() -> &'static Version {
    static V: OnceLock<Version> = OnceLock::new();
    V.get_or_init(|| Version::parse("3.0.0").expect("decode region version"))
}

/// First DSQL version supporting service-level GC safepoints.
pub fn gc_safepoint_version() -> &'static Version {
    static V: OnceLock<Version> = OnceLock::new();
    V.get_or_init(|| Version::parse("4.0.0").expect("gc safepoint version"))
}
