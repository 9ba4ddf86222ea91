//! Galleon Dump: a logical dump engine for MySQL-protocol servers.
//!
//! The engine extracts schema and row data from MySQL, MariaDB, or a
//! distributed SQL engine and writes portable artifacts to an external blob
//! store under a chosen consistency regime. The orchestrator negotiates the
//! regime and a server snapshot, enumerates the catalog, splits tables into
//! independently dumpable chunks, and drives a bounded worker pool, while a
//! background keeper holds back storage-layer garbage collection for the
//! pinned snapshot.

pub mod catalog;
pub mod chunking;
pub mod config;
pub mod consistency;
pub mod dumper;
pub mod keycodec;
pub mod metadata;
pub mod metrics;
pub mod safepoint;
pub mod server;
pub mod sql;
pub mod status;
pub mod storage;
pub mod task;
pub mod worker;

pub use config::{ConsistencyMode, DumpConfig, TableFilter};
pub use dumper::Dumper;
pub use server::{ServerInfo, ServerKind};
pub use task::{ChunkSource, Task, TableMeta};
