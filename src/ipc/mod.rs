// SPDX-License-Identifier: MIT
//! Daemon transport — a line-oriented protocol over a local Unix domain
//! stream socket exposing `install`, `reload`, and `version`.
//!
//! One JSON object per line: a request carries `{"method": ..., "params":
//! ...}`, and streaming methods reply with repeated `{"line": "..."}`
//! objects terminated by `{"done": true}` or `{"error": "..."}`.

pub mod client;

use crate::daemon::Daemon;
use crate::engine::InstallRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/vin.sock";

#[derive(Debug, Deserialize)]
struct WireRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Default, Deserialize)]
struct InstallParams {
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    #[serde(rename = "ref")]
    version_ref: String,
    build_user: String,
    built_on: String,
}

/// One line of a streamed response, or the terminal frame.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireFrame {
    Line { line: String },
    Done { done: bool },
    Error { error: String },
}

/// Accept connections on `socket_path` until the process is told to stop.
/// Binds the socket fresh on every start — a stale socket file from a
/// previous, uncleanly-stopped daemon is removed first (it cannot still be
/// listening, since binding an in-use path fails outright).
pub async fn serve(daemon: Arc<Daemon>, socket_path: &std::path::Path) -> std::io::Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "listening on socket");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(daemon, stream).await {
                warn!(err = %e, "connection handler error");
            }
        });
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: WireRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                write_frame(&mut write_half, &WireFrame::Error { error: format!("bad request: {e}") }).await?;
                continue;
            }
        };

        match request.method.as_str() {
            "install" => {
                let params: InstallParams = serde_json::from_value(request.params).unwrap_or_default();
                if params.packages.len() > 1 && params.version.is_some() {
                    write_frame(
                        &mut write_half,
                        &WireFrame::Error {
                            error: crate::errors::VinError::MultiplePackagesWithVersion.to_string(),
                        },
                    )
                    .await?;
                    continue;
                }

                match daemon.engine.install(InstallRequest {
                    packages: params.packages,
                    version: params.version,
                    force: params.force,
                }) {
                    Ok(mut rx) => {
                        while let Some(out) = rx.recv().await {
                            write_frame(&mut write_half, &WireFrame::Line { line: out.to_string() }).await?;
                        }
                        write_frame(&mut write_half, &WireFrame::Done { done: true }).await?;
                    }
                    Err(e) => {
                        write_frame(&mut write_half, &WireFrame::Error { error: e.to_string() }).await?;
                    }
                }
            }
            "reload" => {
                let mut rx = daemon.engine.reload();
                while let Some(out) = rx.recv().await {
                    write_frame(&mut write_half, &WireFrame::Line { line: out.to_string() }).await?;
                }
                write_frame(&mut write_half, &WireFrame::Done { done: true }).await?;
            }
            "version" => {
                let resp = VersionResponse {
                    version_ref: env!("CARGO_PKG_VERSION").to_string(),
                    build_user: option_env!("VIN_BUILD_USER").unwrap_or("unknown").to_string(),
                    built_on: option_env!("VIN_BUILT_ON").unwrap_or("unknown").to_string(),
                };
                let payload = serde_json::to_string(&resp).unwrap_or_default();
                write_half.write_all(payload.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
            }
            other => {
                error!(method = %other, "unknown RPC method");
                write_frame(&mut write_half, &WireFrame::Error { error: format!("unknown method {other:?}") }).await?;
            }
        }

        write_half.flush().await?;
    }

    Ok(())
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, frame: &WireFrame) -> std::io::Result<()> {
    let payload = serde_json::to_string(frame).unwrap_or_default();
    w.write_all(payload.as_bytes()).await?;
    w.write_all(b"\n").await
}
