// SPDX-License-Identifier: MIT
//! The error taxonomy for `vin`.
//!
//! Every variant here is surfaced to the output stream with context and
//! terminates the RPC call; there are no retries. `VinError` implements
//! `std::error::Error` via `thiserror` so it composes with `anyhow::Context`
//! at call sites the way the rest of the daemon does.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VinError {
    #[error("failed to load host config: {0}")]
    ConfigLoad(String),

    #[error("manifest parse error at {path}: {msg}")]
    ManifestParse { path: PathBuf, msg: String },

    #[error("invalid dependency \"{0}\"")]
    InvalidDep(String),

    #[error("no manifest for \"{name}\" satisfies \"{constraint}\"")]
    NoSatisfier { name: String, constraint: String },

    #[error("{manifest}: unknown profile \"{profile}\"")]
    UnknownProfile { manifest: String, profile: String },

    #[error("circular dependency: \"{from}\" -> \"{to}\"")]
    CircularDependency { from: String, to: String },

    #[error("download failed: {url} returned status {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported archive format (mime: {0})")]
    UnsupportedArchive(String),

    #[error("template error in \"{raw}\": {msg}")]
    TemplateError { raw: String, msg: String },

    #[error("command failed (exit {code:?}): {command}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("working_dir for {manifest} escapes its cache directory")]
    WorkingDirEscape { manifest: String },

    #[error("no packages given")]
    EmptyPackage,

    #[error("empty command string")]
    EmptyCommand,

    #[error("setting a version constraint with multiple packages is not supported")]
    MultiplePackagesWithVersion,

    #[error("state database I/O error: {0}")]
    StateIoError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VinError>;
