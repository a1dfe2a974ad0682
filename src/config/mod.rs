// SPDX-License-Identifier: MIT
//! Host configuration — build flags shared across every installation task.
//!
//! Holds build flags that every installation task's templated commands get
//! access to (`.ConfigureFlags`, `.MakeOpts`, `.CFlags`, `.CXXFlags`). Loaded
//! once at daemon start and reloadable alongside the manifest store.

use crate::errors::VinError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/vinyl/vin.toml";

/// `{config_file}` — all fields are optional; absence means "use the empty
/// string".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Flags passed to `./configure`. `--prefix` is always supplied by `vin`
    /// itself via the manifest's cache/working directory, not by this field.
    #[serde(default, rename = "configure_flags")]
    pub configure_flags: String,

    /// Flags passed to `make`.
    #[serde(default, rename = "MAKEOPTS")]
    pub make_opts: String,

    /// Injected into the build environment as `CFLAGS`.
    #[serde(default, rename = "CFLAGS")]
    pub cflags: String,

    /// Injected into the build environment as `CXXFLAGS`.
    #[serde(default, rename = "CXXFLAGS")]
    pub cxxflags: String,
}

impl HostConfig {
    /// Load from `path`, defaulting to `/etc/vinyl/vin.toml` (overridable via
    /// `VIN_CONFIG`). A missing file is not an error — the daemon must be
    /// able to start with zero configuration before `advise` has ever been
    /// run. A malformed file is `ConfigLoad` and is fatal at startup.
    pub fn load(path: Option<&Path>) -> Result<Self, VinError> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "host config not found — using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(VinError::ConfigLoad(format!("{}: {e}", path.display()))),
        };

        toml::from_str(&raw).map_err(|e| {
            error!(path = %path.display(), err = %e, "failed to parse host config");
            VinError::ConfigLoad(format!("{}: {e}", path.display()))
        })
    }

    pub fn default_path() -> PathBuf {
        std::env::var("VIN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Render as TOML, used by both `advise` and tests that round-trip it.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// The config `advise` emits: a sane starting point for a fresh machine, the
/// flags lifted verbatim from the original `vin advise` implementation.
pub fn advise() -> HostConfig {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let jobs = std::cmp::max(cpus.saturating_sub(1), 1);

    let hardened_flags = "-D_FORTIFY_SOURCE=2 -fasynchronous-unwind-tables -fexceptions -fpie \
         -Wl,-pie -fpic -shared -fstack-clash-protection -fstack-protector-strong -mcet \
         -fcf-protection -O2 -pipe -Wall -Werror=format-security \
         -Werror=implicit-function-declaration -Wl,-z,defs"
        .to_string();

    HostConfig {
        configure_flags: "--prefix=/ --enable-openssl".to_string(),
        make_opts: format!("-j{jobs}"),
        cflags: hardened_flags.clone(),
        cxxflags: hardened_flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = HostConfig::load(Some(Path::new("/nonexistent/vin.toml"))).unwrap();
        assert_eq!(cfg.configure_flags, "");
    }

    #[test]
    fn malformed_file_is_config_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vin.toml");
        std::fs::write(&path, "not = [valid toml").unwrap();

        let err = HostConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, VinError::ConfigLoad(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vin.toml");
        std::fs::write(
            &path,
            r#"configure_flags = "--prefix=/"
MAKEOPTS = "-j4"
CFLAGS = "-O2"
CXXFLAGS = "-O2"
"#,
        )
        .unwrap();

        let cfg = HostConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.configure_flags, "--prefix=/");
        assert_eq!(cfg.make_opts, "-j4");
    }

    #[test]
    fn advise_output_parses_back_as_host_config() {
        let advised = advise();
        let toml = advised.to_toml();
        let parsed: HostConfig = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.configure_flags, advised.configure_flags);
        assert_eq!(parsed.make_opts, advised.make_opts);
        assert_eq!(parsed.cflags, advised.cflags);
    }
}
