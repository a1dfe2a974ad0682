// SPDX-License-Identifier: MIT
//! The state store — persists the installed set and the user-declared
//! "world" set to a single file.
//!
//! Data is serialised whole into an in-memory buffer and only then written
//! to disk, so a crash mid-write never leaves a half-written state file.
//! See DESIGN.md for why `bincode` was picked over a relational store for
//! this record.

use crate::errors::VinError;
use crate::manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_STATE_PATH: &str = "/etc/vinyl/vin.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateData {
    /// `{pkg_name: constraint}` — the top-level packages the user asked for.
    pub world: HashMap<String, String>,
    /// `{manifest_id: installed_at}` — every installed manifest identity.
    pub installed: HashMap<String, DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

pub struct StateDb {
    path: PathBuf,
    data: StateData,
}

impl StateDb {
    /// Load from `path` (default `/etc/vinyl/vin.db`, overridable via
    /// `VIN_STATE_DB`). A missing file creates and flushes an empty state.
    pub async fn load(path: Option<&Path>) -> Result<Self, VinError> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let data: StateData = bincode::deserialize(&bytes)
                    .map_err(|e| VinError::StateIoError(format!("corrupt state db: {e}")))?;
                Ok(Self { path, data })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "state db not found — creating empty state");
                let db = Self {
                    path,
                    data: StateData {
                        world: HashMap::new(),
                        installed: HashMap::new(),
                        last_update: Utc::now(),
                    },
                };
                db.write().await?;
                Ok(db)
            }
            Err(e) => Err(VinError::StateIoError(e.to_string())),
        }
    }

    pub fn default_path() -> PathBuf {
        std::env::var("VIN_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_PATH))
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.data.installed.contains_key(id)
    }

    pub fn add_installed(&mut self, id: &str, t: DateTime<Utc>) {
        self.data.installed.insert(id.to_string(), t);
        self.data.last_update = Utc::now();
    }

    pub fn add_world(&mut self, name: &str, constraint: &str) {
        self.data.world.insert(name.to_string(), constraint.to_string());
        self.data.last_update = Utc::now();
    }

    /// A synthetic manifest depending on every package in `world`, used by a
    /// possible future "rebuild world" action.
    pub fn meta(&self, cache_root: &Path) -> Manifest {
        Manifest::world_meta(&self.data.world, self.data.last_update.timestamp(), cache_root)
    }

    /// Serialise fully to memory first, then write the whole buffer to disk
    /// with mode 0640 — the previous file is never truncated until the new
    /// payload is ready.
    pub async fn write(&self) -> Result<(), VinError> {
        let bytes = bincode::serialize(&self.data)
            .map_err(|e| VinError::StateIoError(format!("failed to encode state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| VinError::StateIoError(e.to_string()))?;
            }
        }

        tokio::fs::write(&self.path, &bytes)
            .await
            .map_err(|e| VinError::StateIoError(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o640)).await
            {
                warn!(path = %self.path.display(), err = %e, "failed to set state db permissions");
            }
        }

        Ok(())
    }
}
