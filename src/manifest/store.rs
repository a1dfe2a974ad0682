// SPDX-License-Identifier: MIT
//! The manifest repository — an in-memory, reloadable indexed store of
//! package manifests, walked from a colon-separated list of root
//! directories (`VIN_PATH`). Reload is atomic: an `Arc<Index>` snapshot is
//! built fully before swapping, so a reader never observes a partially
//! rebuilt index.

use crate::errors::VinError;
use crate::manifest::model::{Manifest, LATEST_SENTINEL, MANIFEST_FILENAME};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Snapshot of the indexed manifest set. Replaced wholesale on reload so
/// concurrent readers never observe a partially built index.
#[derive(Default, Clone)]
struct Index {
    by_id: HashMap<String, Arc<Manifest>>,
    by_provides: HashMap<String, Vec<Arc<Manifest>>>,
}

impl Index {
    fn insert(&mut self, m: Arc<Manifest>) {
        self.by_provides
            .entry(m.provides.clone())
            .or_default()
            .push(m.clone());
        self.by_id.insert(m.id.clone(), m);
    }
}

pub struct ManifestStore {
    roots: Vec<PathBuf>,
    cache_root: PathBuf,
    index: RwLock<Arc<Index>>,
}

impl ManifestStore {
    /// Walk `roots` and build the initial index.
    pub async fn new(roots: Vec<PathBuf>, cache_root: PathBuf) -> Result<Self, VinError> {
        let index = build_index(&roots, &cache_root)?;
        Ok(Self {
            roots,
            cache_root,
            index: RwLock::new(Arc::new(index)),
        })
    }

    /// Parse `VIN_PATH` (colon-separated) into root directories.
    pub fn roots_from_env(var: &str) -> Vec<PathBuf> {
        std::env::var(var)
            .unwrap_or_default()
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// Rebuild the entire index and swap it in atomically. Build happens
    /// against a scratch `Index`; only on success does the live pointer move,
    /// so a failed reload leaves the previous index intact.
    pub async fn reload(&self) -> Result<(), VinError> {
        info!(roots = ?self.roots, "reloading manifest store");
        let new_index = build_index(&self.roots, &self.cache_root)?;
        let mut guard = self.index.write().await;
        *guard = Arc::new(new_index);
        Ok(())
    }

    /// Every manifest indexed under `name` whose version satisfies
    /// `constraint`. The `>=0` sentinel falls back to the single
    /// highest-versioned manifest (including pre-releases) when the normal
    /// filter is empty.
    pub async fn satisfies(&self, name: &str, constraint: &str) -> Vec<Arc<Manifest>> {
        let index = self.index.read().await.clone();
        satisfies_in(&index, name, constraint)
    }

    /// Highest version satisfying `constraint`, or `NoSatisfier`.
    pub async fn latest(&self, name: &str, constraint: &str) -> Result<Arc<Manifest>, VinError> {
        let mut candidates = self.satisfies(name, constraint).await;
        candidates.sort_by(|a, b| a.version.cmp(&b.version));
        candidates.pop().ok_or_else(|| VinError::NoSatisfier {
            name: name.to_string(),
            constraint: constraint.to_string(),
        })
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Manifest>> {
        let index = self.index.read().await.clone();
        index.by_id.get(id).cloned()
    }

    /// Run `body` against a snapshot of the store with `extra` temporarily
    /// inserted, then restore the original snapshot regardless of outcome.
    /// Used to register the synthetic multi-package meta-manifest for the
    /// duration of a single `install()` call.
    pub async fn with_temp_manifest<F, Fut, T>(&self, extra: Arc<Manifest>, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let original = {
            let guard = self.index.read().await;
            guard.clone()
        };

        let mut scratch = (*original).clone();
        scratch.insert(extra);

        {
            let mut guard = self.index.write().await;
            *guard = Arc::new(scratch);
        }

        let result = body().await;

        {
            let mut guard = self.index.write().await;
            *guard = original;
        }

        result
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }
}

fn satisfies_in(index: &Index, name: &str, constraint: &str) -> Vec<Arc<Manifest>> {
    let Some(candidates) = index.by_provides.get(name) else {
        return Vec::new();
    };

    let req = match semver::VersionReq::parse(constraint) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    let mut matched: Vec<Arc<Manifest>> = candidates
        .iter()
        .filter(|m| req.matches(&m.version))
        .cloned()
        .collect();

    if matched.is_empty() && constraint.trim() == LATEST_SENTINEL {
        if let Some(highest) = candidates.iter().max_by(|a, b| a.version.cmp(&b.version)) {
            matched.push(highest.clone());
        }
    }

    matched
}

fn build_index(roots: &[PathBuf], cache_root: &Path) -> Result<Index, VinError> {
    let mut index = Index::default();

    for root in roots {
        walk_dir(root, cache_root, &mut index)?;
    }

    Ok(index)
}

fn walk_dir(dir: &Path, cache_root: &Path, index: &mut Index) -> Result<(), VinError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()), // a missing root directory simply contributes nothing
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            walk_dir(&path, cache_root, index)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILENAME) {
            debug!(path = %path.display(), "parsing manifest");
            let manifest = Manifest::load(&path, cache_root)?;
            index.insert(Arc::new(manifest));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, provides: &str, version: &str) {
        let pkg_dir = dir.join(provides).join(version);
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(
            pkg_dir.join(MANIFEST_FILENAME),
            format!(
                r#"
provides = "{provides}"
version = "{version}"
checksum = "deadbeef"
licence = "MIT"
tarball = "https://example.com/t.tar.gz"
"#
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn satisfies_filters_by_version() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "app-utils", "1.0.3");
        write_manifest(root.path(), "app-utils", "0.9.0");

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let matches = store.satisfies("app-utils", ">=1.0.0").await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].version_str, "1.0.3");
    }

    #[tokio::test]
    async fn latest_sentinel_falls_back_to_highest_prerelease() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "complex-versions-app", "3.2.1-r1");
        write_manifest(root.path(), "complex-versions-app", "3.1.0-r4");

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let m = store
            .latest("complex-versions-app", LATEST_SENTINEL)
            .await
            .unwrap();
        assert_eq!(m.version_str, "3.2.1-r1");
    }

    #[tokio::test]
    async fn latest_fails_with_no_satisfier() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "standalone", "1.0.0");

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let err = store.latest("standalone", ">2.0.0").await.unwrap_err();
        assert!(matches!(err, VinError::NoSatisfier { .. }));
    }

    #[tokio::test]
    async fn reload_is_atomic_on_failure() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "app-utils", "1.0.3");

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        // Introduce a broken manifest alongside the good one.
        let broken_dir = root.path().join("broken").join("1.0.0");
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join(MANIFEST_FILENAME), "not valid toml [[[").unwrap();

        assert!(store.reload().await.is_err());

        // Old index must still answer queries.
        let matches = store.satisfies("app-utils", ">=1.0.0").await;
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn with_temp_manifest_is_removed_on_return() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "app-utils", "1.0.3");

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let synthetic = Arc::new(Manifest::synthetic_request(
            &["app-utils".to_string()],
            cache.path(),
        ));

        store
            .with_temp_manifest(synthetic, || async {
                assert!(store.get("packages 0.0.0").await.is_some());
            })
            .await;

        assert!(store.get("packages 0.0.0").await.is_none());
    }
}
