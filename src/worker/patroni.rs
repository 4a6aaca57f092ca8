//! Patroni REST API client
//!
//! Only `PATCH /config` is needed: setting `pause` stops Patroni from
//! restarting or failing over members while they are being taken down.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Result, WorkerError};
use crate::resources::common::PATRONI_PORT;

/// Bound on the whole request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause cluster management through the API reachable at `host`
pub async fn pause(host: &str) -> Result<()> {
    patch_config(host, r#"{"pause":true}"#).await
}

async fn patch_config(host: &str, body: &'static str) -> Result<()> {
    tokio::time::timeout(REQUEST_TIMEOUT, send_patch(host, body))
        .await
        .map_err(|_| WorkerError::Patroni(format!("request to {} timed out", host)))?
}

async fn send_patch(host: &str, body: &'static str) -> Result<()> {
    let port = u16::try_from(PATRONI_PORT)
        .map_err(|e| WorkerError::Patroni(format!("invalid port: {}", e)))?;
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| WorkerError::Patroni(e.to_string()))?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| WorkerError::Patroni(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            trace!(error = %e, "Patroni connection closed");
        }
    });

    let req = Request::builder()
        .method("PATCH")
        .uri("/config")
        .header("Host", format!("{}:{}", host, port))
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .map_err(|e| WorkerError::Patroni(e.to_string()))?;

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| WorkerError::Patroni(e.to_string()))?;

    let status = response.status();
    debug!(host, status = status.as_u16(), "Patroni config patched");
    if !status.is_success() {
        return Err(WorkerError::Patroni(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )));
    }
    Ok(())
}
