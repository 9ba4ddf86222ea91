//! Fire-and-forget status endpoint.
//!
//! Serves the progress counters as JSON on every request. Plain tokio TCP
//! with a hand-written response; the dump has no business carrying an HTTP
//! framework for one read-only endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::DumpMetrics;

pub fn spawn_status_server(
    addr: SocketAddr,
    metrics: Arc<DumpMetrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = run_status_server(addr, metrics, cancel).await {
            tracing::warn!(%addr, error = %err, "status endpoint stopped");
        }
    })
}

async fn run_status_server(
    addr: SocketAddr,
    metrics: Arc<DumpMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind status endpoint {addr}"))?;
    tracing::info!(%addr, "status endpoint listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accept = listener.accept() => {
                let (stream, _) = accept.context("accept status connection")?;
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let _ = handle_status_connection(stream, metrics).await;
                });
            }
        }
    }
}

async fn handle_status_connection(
    mut stream: TcpStream,
    metrics: Arc<DumpMetrics>,
) -> Result<()> {
    // Drain whatever request line arrives; the response is the same for all.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await;

    let body = serde_json::to_string(&metrics.snapshot())?;
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
