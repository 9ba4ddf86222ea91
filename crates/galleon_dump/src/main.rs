//! Binary entrypoint for running one dump.
//!
//! Startup stays thin: parse flags, install logging, build the dumper, run.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use galleon_dump::{ConsistencyMode, DumpConfig, Dumper, TableFilter};

#[derive(Debug, Parser)]
#[command(name = "galleon-dump", about = "Logical dump engine for MySQL-protocol servers")]
struct DumpArgs {
    /// Server host.
    #[arg(long, short = 'H', default_value = "127.0.0.1")]
    host: String,
    /// Server port.
    #[arg(long, short = 'P', default_value_t = 3306)]
    port: u16,
    /// User name.
    #[arg(long, short = 'u', default_value = "root")]
    user: String,
    /// Password.
    #[arg(long, short = 'p', default_value = "")]
    password: String,
    /// Output directory for dump artifacts.
    #[arg(long, short = 'o', default_value = "./export")]
    output: PathBuf,
    /// Databases to dump; all non-system databases when omitted.
    #[arg(long = "database", short = 'B')]
    databases: Vec<String>,
    /// Consistency regime: auto, lock, flush, snapshot, or none.
    #[arg(long, default_value = "auto")]
    consistency: String,
    /// Number of writer threads.
    #[arg(long, short = 't', default_value_t = 4)]
    threads: usize,
    /// Target rows per chunk; chunking is disabled when omitted.
    #[arg(long, short = 'r')]
    rows: Option<u64>,
    /// WHERE clause appended to every data select.
    #[arg(long, default_value = "")]
    r#where: String,
    /// Dump the result of this SQL statement instead of tables.
    #[arg(long, default_value = "")]
    sql: String,
    /// Server snapshot handle (TSO or timestamp); acquired when omitted.
    #[arg(long, default_value = "")]
    snapshot: String,
    /// Table filter rules, `db.table` with `*` wildcards; `!` excludes.
    #[arg(long = "filter", short = 'f')]
    filters: Vec<String>,
    /// Dump schemas only.
    #[arg(long)]
    no_data: bool,
    /// Dump data only.
    #[arg(long, short = 'm')]
    no_schemas: bool,
    /// Skip views.
    #[arg(long, short = 'W')]
    no_views: bool,
    /// Emit complete INSERT statements with column lists.
    #[arg(long)]
    complete_insert: bool,
    /// Release table locks as soon as all worker transactions have begun.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    transactional_consistency: bool,
    /// Record the server position again after worker connections are live.
    #[arg(long)]
    pos_after_connect: bool,
    /// Per-query memory quota on DSQL servers, in bytes.
    #[arg(long)]
    tidb_mem_quota_query: Option<u64>,
    /// Listen address of the status endpoint, e.g. 127.0.0.1:8281.
    #[arg(long)]
    status_addr: Option<SocketAddr>,
}

impl DumpArgs {
    fn into_config(self) -> Result<DumpConfig> {
        let consistency: ConsistencyMode = self.consistency.parse()?;
        let filter = TableFilter::parse(&self.filters)?;
        Ok(DumpConfig {
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            databases: self.databases,
            consistency,
            threads: self.threads,
            rows: self.rows,
            where_clause: self.r#where,
            sql: self.sql,
            snapshot: self.snapshot,
            no_data: self.no_data,
            no_schemas: self.no_schemas,
            no_views: self.no_views,
            complete_insert: self.complete_insert,
            transactional_consistency: self.transactional_consistency,
            pos_after_connect: self.pos_after_connect,
            tidb_mem_quota_query: self.tidb_mem_quota_query,
            filter,
            output: self.output,
            status_addr: self.status_addr,
            ..DumpConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("galleon_dump=info,warn")),
        )
        .init();

    let args = DumpArgs::parse();
    let config = args.into_config()?;
    let mut dumper = Dumper::new(config).await?;
    let result = dumper.dump().await;
    dumper.close().await;
    result
}
