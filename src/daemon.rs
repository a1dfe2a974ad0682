// SPDX-License-Identifier: MIT
//! The daemon's global state — host config, manifest store, state DB, and
//! engine, threaded explicitly through the transport layer as a single
//! `Daemon` value rather than ambient globals.

use crate::config::HostConfig;
use crate::engine::Engine;
use crate::errors::VinError;
use crate::manifest::ManifestStore;
use crate::state::StateDb;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

const DEFAULT_CACHE_ROOT: &str = "/var/cache/vin";
const DEFAULT_SVC_ROOT: &str = "/etc/vinit/svc";

pub struct Daemon {
    pub host_config: Arc<RwLock<HostConfig>>,
    pub store: Arc<ManifestStore>,
    pub state: Arc<Mutex<StateDb>>,
    pub engine: Arc<Engine>,
    pub cache_root: PathBuf,
}

impl Daemon {
    /// Assemble a `Daemon` from its environment variables: `VIN_PATH`,
    /// `VIN_CONFIG`, `VIN_CACHE`, `VIN_STATE_DB`, `VINIT_SVC_DIR`.
    pub async fn bootstrap() -> Result<Self, VinError> {
        let cache_root = std::env::var("VIN_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_ROOT));
        let svc_root = std::env::var("VINIT_SVC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SVC_ROOT));

        let host_config = HostConfig::load(None)?;
        info!(
            configure_flags = %host_config.configure_flags,
            make_opts = %host_config.make_opts,
            "host config loaded"
        );

        let roots = ManifestStore::roots_from_env("VIN_PATH");
        let store = Arc::new(ManifestStore::new(roots, cache_root.clone()).await?);

        let state = Arc::new(Mutex::new(StateDb::load(None).await?));
        let host_config = Arc::new(RwLock::new(host_config));

        let engine = Arc::new(Engine::new(
            store.clone(),
            state.clone(),
            host_config.clone(),
            cache_root.clone(),
            svc_root,
        ));

        Ok(Self {
            host_config,
            store,
            state,
            engine,
            cache_root,
        })
    }
}
