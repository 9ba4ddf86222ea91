//! Global metadata artifact: where a downstream replica should start.
//!
//! The recorder accumulates a small text blob (server position or snapshot,
//! start/finish timestamps) and writes it to the external store only after a
//! successful dump. Recording is best-effort; failures are logged, never
//! fatal.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::server::ServerKind;
use crate::sql::SqlConn;
use crate::storage::ExternalStorage;

const METADATA_ARTIFACT: &str = "metadata";
const TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Accumulates the metadata blob across the dump lifecycle.
pub struct GlobalMetadata {
    /// DSQL snapshot TSO, when one was pinned for the dump.
    snapshot: String,
    buffer: String,
}

impl GlobalMetadata {
    pub fn new(snapshot: impl Into<String>) -> Self {
        Self {
            snapshot: snapshot.into(),
            buffer: String::new(),
        }
    }

    pub fn record_start_time(&mut self) {
        self.buffer.push_str(&format!(
            "Started dump at: {}\n\n",
            Utc::now().format(TIME_LAYOUT)
        ));
    }

    pub fn record_finish_time(&mut self) {
        self.buffer.push_str(&format!(
            "Finished dump at: {}\n",
            Utc::now().format(TIME_LAYOUT)
        ));
    }

    /// Captures the server position. With `after_conn` the section is marked
    /// as the safe-mode exit position for downstream consumers.
    pub async fn record_global_metadata(
        &mut self,
        conn: &mut dyn SqlConn,
        server_kind: ServerKind,
        after_conn: bool,
    ) -> Result<()> {
        let header = if after_conn {
            "SHOW MASTER STATUS: /* AFTER CONNECTION POOL ESTABLISHED */"
        } else {
            "SHOW MASTER STATUS:"
        };

        if server_kind == ServerKind::Dsql && !self.snapshot.is_empty() {
            self.buffer
                .push_str(&format!("{header}\n\tPos: {}\n\n", self.snapshot));
            return Ok(());
        }

        let row = conn
            .query_row("SHOW MASTER STATUS")
            .await
            .context("show master status")?
            .ok_or_else(|| anyhow::anyhow!("SHOW MASTER STATUS returned no rows"))?;
        let log_file = row.first().cloned().flatten().unwrap_or_default();
        let position = row.get(1).cloned().flatten().unwrap_or_default();
        // MySQL reports the executed GTID set as the fifth column; MariaDB
        // exposes it through a variable instead.
        let gtid = match row.get(4).cloned().flatten() {
            Some(gtid) => gtid,
            None if server_kind == ServerKind::MariaDb => conn
                .query_row("SELECT @@global.gtid_binlog_pos")
                .await?
                .and_then(|row| row.into_iter().next().flatten())
                .unwrap_or_default(),
            None => String::new(),
        };

        self.buffer.push_str(&format!(
            "{header}\n\tLog: {log_file}\n\tPos: {position}\n\tGTID: {gtid}\n\n"
        ));
        Ok(())
    }

    /// Writes the accumulated blob. Only called when the dump succeeded.
    pub async fn write_global_metadata(&self, store: &dyn ExternalStorage) -> Result<()> {
        store
            .write_artifact(METADATA_ARTIFACT, self.buffer.as_bytes())
            .await
            .context("write global metadata artifact")
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }
}
