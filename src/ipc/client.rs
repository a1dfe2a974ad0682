// SPDX-License-Identifier: MIT
//! A lightweight client for the CLI front-end's subcommands to dial the
//! daemon's Unix socket: connect once per call, write one JSON request
//! line, and read the line-delimited response framing back from
//! `ipc::serve`.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub struct DaemonClient {
    socket_path: PathBuf,
}

#[derive(Serialize)]
struct WireRequest<'a, P: Serialize> {
    method: &'a str,
    params: P,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn socket_path_from_env() -> PathBuf {
        std::env::var("VIN_SOCKET_ADDR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(crate::ipc::DEFAULT_SOCKET_PATH))
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to daemon at {}", self.socket_path.display()))
    }

    /// Call a streaming method (`install`/`reload`), invoking `on_line` for
    /// every progress line until the server sends its terminal frame.
    pub async fn call_streaming<P: Serialize>(
        &self,
        method: &str,
        params: P,
        mut on_line: impl FnMut(&str),
    ) -> Result<()> {
        let mut stream = self.connect().await?;
        let request = WireRequest { method, params };
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        stream.write_all(&payload).await?;

        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            let frame: Value = serde_json::from_str(&line)
                .with_context(|| format!("malformed response frame: {line}"))?;

            if let Some(l) = frame.get("line").and_then(Value::as_str) {
                on_line(l);
            } else if frame.get("done").and_then(Value::as_bool) == Some(true) {
                return Ok(());
            } else if let Some(err) = frame.get("error").and_then(Value::as_str) {
                bail!("{err}");
            }
        }

        Ok(())
    }

    /// Call the unary `version` method and return its parsed response.
    pub async fn version(&self) -> Result<Value> {
        let mut stream = self.connect().await?;
        let request = WireRequest { method: "version", params: Value::Null };
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        stream.write_all(&payload).await?;

        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let line = lines
            .next_line()
            .await?
            .context("daemon closed the connection before responding")?;
        Ok(serde_json::from_str(&line)?)
    }
}

/// The CLI-side arity check performed ahead of ever dialing the socket:
/// `install` rejects a version constraint when more than one package is
/// requested.
pub fn reject_version_with_multiple_packages(packages: &[String], version: &Option<String>) -> Result<()> {
    if packages.len() > 1 && version.is_some() {
        bail!("{}", crate::errors::VinError::MultiplePackagesWithVersion);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_version_with_multiple_packages() {
        let err = reject_version_with_multiple_packages(
            &["a".to_string(), "b".to_string()],
            &Some("1.0.0".to_string()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiple packages"));
    }

    #[test]
    fn allows_version_with_single_package() {
        assert!(reject_version_with_multiple_packages(&["a".to_string()], &Some("1.0.0".to_string())).is_ok());
    }

    #[test]
    fn allows_no_version_with_multiple_packages() {
        assert!(reject_version_with_multiple_packages(&["a".to_string(), "b".to_string()], &None).is_ok());
    }
}
