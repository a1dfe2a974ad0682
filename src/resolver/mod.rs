// SPDX-License-Identifier: MIT
//! The dependency resolver — a depth-first, constraint-accumulating graph
//! solver that restarts on conflict rather than backtracking.
//!
//! Control state (`constraints`, `seen`, `resolved`, `tasks`, `depth`) lives
//! on an explicit struct rather than the call stack, so a restart can clear
//! `seen`/`resolved`/`tasks` while deliberately keeping `constraints` —
//! the next pass picks the right version first time. The depth-first
//! traversal itself is expressed with an owned `Pin<Box<dyn Future>>`
//! recursion since async fns can't recurse directly.

use crate::errors::VinError;
use crate::manifest::{Manifest, ManifestStore, LATEST_SENTINEL};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const DEFAULT_PROFILE: &str = "default";

/// Per-solve ephemeral state.
struct State {
    constraints: HashMap<String, Vec<String>>,
    seen: HashMap<String, Arc<Manifest>>,
    resolved: HashMap<String, Arc<Manifest>>,
    tasks: Vec<Arc<Manifest>>,
    depth: i32,
}

impl State {
    fn new() -> Self {
        Self {
            constraints: HashMap::new(),
            seen: HashMap::new(),
            resolved: HashMap::new(),
            tasks: Vec::new(),
            depth: 0,
        }
    }

    /// Clears `seen`/`resolved`/`tasks` on restart; `constraints` survive —
    /// this asymmetry is what guarantees the restart loop converges.
    fn restart_reset(&mut self) {
        self.seen.clear();
        self.resolved.clear();
        self.tasks.clear();
    }
}

pub struct Resolver<'a> {
    store: &'a ManifestStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a ManifestStore) -> Self {
        Self { store }
    }

    /// `solve(profile, root_pkg, constraint?) -> ordered plan`. `constraint
    /// == None` means "latest" (the `>=0` sentinel).
    pub async fn solve(
        &self,
        profile: &str,
        root_pkg: &str,
        constraint: Option<&str>,
    ) -> Result<Vec<Arc<Manifest>>, VinError> {
        let con = constraint.unwrap_or(LATEST_SENTINEL);
        let root = self.store.latest(root_pkg, con).await?;

        let mut state = State::new();
        self.solve_one(&mut state, root, profile).await?;

        Ok(state.tasks)
    }

    fn solve_one<'b>(
        &'b self,
        state: &'b mut State,
        m: Arc<Manifest>,
        profile: &'b str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, VinError>> + 'b>> {
        Box::pin(async move {
            state.depth += 1;
            let result = self.solve_body(state, &m, profile).await;
            state.depth -= 1;
            result
        })
    }

    /// Returns `Ok(true)` when this frame is signalling "restart the search"
    /// to its caller (only meaningful above the top frame; at the top frame
    /// a restart is absorbed by re-looping, never returned).
    async fn solve_body(
        &self,
        state: &mut State,
        m: &Arc<Manifest>,
        profile: &str,
    ) -> Result<bool, VinError> {
        state.seen.insert(m.provides.clone(), m.clone());

        // An unknown profile does not short-circuit immediately — the dep
        // loop simply has nothing to iterate, and the manifest still gets
        // appended to `tasks` before the pending error is returned.
        let mut pending_unknown_profile = false;
        let deps: Vec<crate::manifest::Dep> = match m.profiles.get(profile) {
            Some(p) => p.deps.clone(),
            None => {
                pending_unknown_profile = true;
                Vec::new()
            }
        };

        let mut i: i64 = 0;
        while (i as usize) < deps.len() {
            let dep = deps[i as usize].clone();
            let pkg = dep.package().to_string();
            let constraint = dep.constraint().to_string();

            let entry = state.constraints.entry(pkg.clone()).or_default();
            entry.push(constraint);
            let joined = entry.join(", ");

            let m1 = self.store.latest(&pkg, &joined).await?;

            if let Some(prev) = state.seen.get(&pkg).cloned() {
                if !Arc::ptr_eq(&prev, &m1) {
                    state.seen.remove(&pkg);

                    if state.depth > 1 {
                        state.restart_reset();
                        return Ok(true);
                    }

                    state.restart_reset();
                    i = 0;
                    continue;
                }

                if !state.resolved.contains_key(&pkg) {
                    return Err(VinError::CircularDependency {
                        from: m.provides.clone(),
                        to: pkg.clone(),
                    });
                }
            }

            let restart = self.solve_one(state, m1, profile).await?;
            if restart {
                if state.depth > 1 {
                    return Ok(true);
                }
                i = 0;
                continue;
            }

            i += 1;
        }

        if !state.tasks.iter().any(|t| Arc::ptr_eq(t, m)) {
            state.tasks.push(m.clone());
        }
        state.resolved.insert(m.provides.clone(), m.clone());

        if pending_unknown_profile {
            return Err(VinError::UnknownProfile {
                manifest: m.id.clone(),
                profile: profile.to_string(),
            });
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILENAME;
    use std::path::Path;

    fn write_manifest(dir: &Path, provides: &str, version: &str, deps: &[(&str, &str)]) {
        let pkg_dir = dir.join(provides).join(version);
        std::fs::create_dir_all(&pkg_dir).unwrap();

        let deps_toml: String = deps
            .iter()
            .map(|(n, c)| format!(r#"["{n}", "{c}"]"#))
            .collect::<Vec<_>>()
            .join(", ");

        std::fs::write(
            pkg_dir.join(MANIFEST_FILENAME),
            format!(
                r#"
provides = "{provides}"
version = "{version}"
checksum = "deadbeef"
licence = "MIT"
tarball = "https://example.com/t.tar.gz"

[profiles.default]
deps = [{deps_toml}]
"#
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn solves_diamond_dependency_in_topological_order() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        write_manifest(
            root.path(),
            "sample-app",
            "1.0.0",
            &[("user-lib", ">=1.4"), ("some-security-library", ">=1.8")],
        );
        write_manifest(
            root.path(),
            "user-lib",
            "1.5.0",
            &[("app-utils", ">=1.0"), ("some-security-library", ">=1.8.5")],
        );
        write_manifest(root.path(), "app-utils", "1.0.3", &[]);
        write_manifest(root.path(), "some-security-library", "1.8.9", &[]);

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let resolver = Resolver::new(&store);
        let plan = resolver
            .solve(DEFAULT_PROFILE, "sample-app", Some(">=1.0.0"))
            .await
            .unwrap();

        let ids: Vec<&str> = plan.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "app-utils 1.0.3",
                "some-security-library 1.8.9",
                "user-lib 1.5.0",
                "sample-app 1.0.0",
            ]
        );
    }

    #[tokio::test]
    async fn detects_three_package_cycle() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        write_manifest(root.path(), "app-1", "1.0.0", &[("app-2", ">=1.0.0")]);
        write_manifest(root.path(), "app-2", "1.0.0", &[("app-3", ">=1.0.0")]);
        write_manifest(root.path(), "app-3", "1.0.0", &[("app-1", ">=1.0.0")]);

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let resolver = Resolver::new(&store);
        let err = resolver
            .solve(DEFAULT_PROFILE, "app-1", Some(">=1.0.0"))
            .await
            .unwrap_err();

        match err {
            VinError::CircularDependency { from, to } => {
                assert_eq!(from, "app-3");
                assert_eq!(to, "app-1");
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_duplicate_identities_and_deps_precede_dependants() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        // `shared` is depended on by both direct deps of `top`.
        write_manifest(
            root.path(),
            "top",
            "1.0.0",
            &[("left", ">=1.0.0"), ("right", ">=1.0.0")],
        );
        write_manifest(root.path(), "left", "1.0.0", &[("shared", ">=1.0.0")]);
        write_manifest(root.path(), "right", "1.0.0", &[("shared", ">=1.0.0")]);
        write_manifest(root.path(), "shared", "1.0.0", &[]);

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let resolver = Resolver::new(&store);
        let plan = resolver
            .solve(DEFAULT_PROFILE, "top", Some(">=1.0.0"))
            .await
            .unwrap();

        let ids: Vec<&str> = plan.iter().map(|m| m.id.as_str()).collect();
        let shared_count = ids.iter().filter(|id| **id == "shared 1.0.0").count();
        assert_eq!(shared_count, 1);

        let shared_idx = ids.iter().position(|id| *id == "shared 1.0.0").unwrap();
        let top_idx = ids.iter().position(|id| *id == "top 1.0.0").unwrap();
        assert!(shared_idx < top_idx);
    }

    #[tokio::test]
    async fn unknown_profile_surfaces_error() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_manifest(root.path(), "solo", "1.0.0", &[]);

        let store = ManifestStore::new(vec![root.path().to_path_buf()], cache.path().to_path_buf())
            .await
            .unwrap();

        let resolver = Resolver::new(&store);
        let err = resolver
            .solve("nonexistent-profile", "solo", Some(">=1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, VinError::UnknownProfile { .. }));
    }
}
