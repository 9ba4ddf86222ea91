//! GC service-safepoint keeper.
//!
//! While a snapshot dump runs against the distributed engine, the storage
//! layer must not garbage-collect MVCC history below the pinned snapshot.
//! The keeper heartbeats a service-scoped safepoint lease on the placement
//! coordinator every `ttl / 2` seconds until cancelled; the hold lapses at
//! most `ttl` after the keeper stops.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default lease length granted per heartbeat.
pub const DEFAULT_GC_SAFEPOINT_TTL_SECS: i64 = 5 * 60;
/// Retries per heartbeat before giving up until the next tick.
const UPDATE_RETRIES: usize = 10;
/// Pause between heartbeat retries.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

const SAFEPOINT_ID_PREFIX: &str = "galleon_dump";

/// Placement-coordinator surface the keeper needs.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Extends the service safepoint lease; returns the cluster-wide minimum
    /// safepoint currently in force.
    async fn update_service_safe_point(
        &self,
        service_id: &str,
        ttl_secs: i64,
        safepoint_ts: u64,
    ) -> Result<u64>;
}

/// Spawns the heartbeat loop. Failures are logged and retried, never fatal:
/// losing the lease only matters for dumps outliving the server's own GC
/// window, and the operator can widen that window by hand.
pub fn spawn_safepoint_keeper(
    cancel: CancellationToken,
    client: Arc<dyn CoordinatorClient>,
    ttl_secs: i64,
    snapshot_ts: u64,
) -> JoinHandle<()> {
    let startup_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let service_id = format!("{SAFEPOINT_ID_PREFIX}_{startup_nanos}");
    tracing::info!(%service_id, "generated gc safepoint service id");

    tokio::spawn(async move {
        let interval = Duration::from_secs((ttl_secs / 2).max(1) as u64);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(safepoint = snapshot_ts, ttl_secs, "extending gc safepoint lease");
            for attempt in 0..=UPDATE_RETRIES {
                match client
                    .update_service_safe_point(&service_id, ttl_secs, snapshot_ts)
                    .await
                {
                    Ok(_) => break,
                    Err(err) => {
                        tracing::debug!(error = %err, attempt, "gc safepoint update failed");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                }
            }
        }
    })
}

/// Converts a snapshot handle into a TSO. Numeric snapshots pass through;
/// datetime snapshots are resolved through the server clock.
pub async fn parse_snapshot_to_tso(
    conn: &mut dyn crate::sql::SqlConn,
    snapshot: &str,
) -> Result<u64> {
    if let Ok(tso) = snapshot.parse::<u64>() {
        return Ok(tso);
    }
    let sql = format!(
        "SELECT unix_timestamp({})",
        crate::sql::quote_str(snapshot)
    );
    let row = conn.query_row(&sql).await?;
    let seconds = row
        .and_then(|row| row.into_iter().next().flatten())
        .ok_or_else(|| anyhow::anyhow!("snapshot {snapshot:?} is not resolvable to a timestamp"))?
        .parse::<f64>()
        .map_err(|_| anyhow::anyhow!("snapshot {snapshot:?} resolved to a non-numeric timestamp"))?;
    // Physical-time TSO layout: milliseconds shifted left by 18 logical bits.
    Ok(((seconds * 1000.0) as u64) << 18)
}
