// SPDX-License-Identifier: MIT
//! The manifest data model — a `Manifest` represents one buildable package
//! version, parsed from a `manifest.toml` file and validated at load time.

use crate::errors::VinError;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILENAME: &str = "manifest.toml";

/// The sentinel constraint meaning "latest" — used both for the root of an
/// unconstrained install and for each dependency of a synthetic
/// meta-manifest.
pub const LATEST_SENTINEL: &str = ">=0";

/// A single dependency: `(package, constraint)`. Serialises from/to a
/// two-element TOML array, matching `[[name, constraint], ...]` manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dep(pub String, pub String);

impl Dep {
    pub fn package(&self) -> &str {
        &self.0
    }

    pub fn constraint(&self) -> &str {
        &self.1
    }

    /// Valid iff both fields are non-empty and the constraint parses as a
    /// semver requirement.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.1.is_empty() && semver::VersionReq::parse(&self.1).is_ok()
    }

    pub fn as_invalid_dep_error(&self) -> VinError {
        VinError::InvalidDep(format!("{} {}", self.0, self.1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub deps: Vec<Dep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commands {
    pub configure: Option<String>,
    pub compile: Option<String>,
    pub install: Option<String>,
    /// Relative to `cache_dir`; defaults to `.` (the cache dir itself).
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Patch file paths, resolved absolute against `manifest_dir` at load
    /// time.
    #[serde(default)]
    pub patches: Vec<String>,
    #[serde(default)]
    pub skip_env: bool,
    pub finaliser: Option<String>,
}

impl Commands {
    /// The three build-stage commands in order, substituting the default
    /// command for any stage that's absent.
    pub fn stages(&self) -> [String; 3] {
        [
            self.configure
                .clone()
                .unwrap_or_else(|| "./configure {{ .ConfigureFlags }}".to_string()),
            self.compile
                .clone()
                .unwrap_or_else(|| "make {{ .MakeOpts }}".to_string()),
            self.install
                .clone()
                .unwrap_or_else(|| "make install {{ .MakeOpts }}".to_string()),
        ]
    }
}

/// Raw, on-disk shape of `manifest.toml` — everything derived (`id`,
/// `cache_dir`, parsed `version`, resolved patch paths) is computed by
/// [`Manifest::from_raw`] after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawManifest {
    provides: String,
    #[serde(rename = "version")]
    version_str: String,
    checksum: String,
    licence: String,
    tarball: String,
    #[serde(default)]
    meta: bool,
    service_dir: Option<String>,
    #[serde(default)]
    profiles: HashMap<String, Profile>,
    #[serde(default)]
    commands: Commands,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub provides: String,
    pub version_str: String,
    pub version: Version,
    pub checksum: String,
    pub licence: String,
    pub tarball: String,
    pub meta: bool,
    pub service_dir: Option<String>,
    pub profiles: HashMap<String, Profile>,
    pub commands: Commands,
    pub manifest_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub id: String,
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Display for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Manifest {
    /// Parse a `manifest.toml` at `path`, deriving `cache_dir`/`id`,
    /// validating the version and every dep, and rejecting an escaping
    /// `working_dir`.
    pub fn load(path: &Path, cache_root: &Path) -> Result<Self, VinError> {
        let manifest_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let raw_text = std::fs::read_to_string(path).map_err(|e| VinError::ManifestParse {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;

        let raw: RawManifest = toml::from_str(&raw_text).map_err(|e| VinError::ManifestParse {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;

        Self::from_raw(raw, manifest_dir, cache_root).map_err(|e| match e {
            VinError::ManifestParse { msg, .. } => VinError::ManifestParse {
                path: path.to_path_buf(),
                msg,
            },
            other => other,
        })
    }

    fn from_raw(
        raw: RawManifest,
        manifest_dir: PathBuf,
        cache_root: &Path,
    ) -> Result<Self, VinError> {
        if raw.provides.is_empty() {
            return Err(VinError::ManifestParse {
                path: manifest_dir.clone(),
                msg: "provides must not be empty".to_string(),
            });
        }
        if raw.version_str.is_empty() {
            return Err(VinError::ManifestParse {
                path: manifest_dir.clone(),
                msg: "version must not be empty".to_string(),
            });
        }

        let version = Version::parse(&raw.version_str).map_err(|e| VinError::ManifestParse {
            path: manifest_dir.clone(),
            msg: format!("invalid version {:?}: {e}", raw.version_str),
        })?;

        for profile in raw.profiles.values() {
            for dep in &profile.deps {
                if !dep.is_valid() {
                    return Err(dep.as_invalid_dep_error());
                }
            }
        }

        let id = format!("{} {}", raw.provides, raw.version_str);
        let cache_dir = cache_root.join(&raw.provides).join(&raw.version_str);

        let working_dir_rel = raw
            .commands
            .working_dir
            .clone()
            .unwrap_or_else(|| ".".to_string());
        let resolved_working_dir = normalize_join(&cache_dir, &working_dir_rel);
        if !resolved_working_dir.starts_with(&cache_dir) {
            return Err(VinError::WorkingDirEscape { manifest: id });
        }

        let mut commands = raw.commands;
        commands.working_dir = Some(
            resolved_working_dir
                .to_string_lossy()
                .into_owned(),
        );
        commands.patches = commands
            .patches
            .into_iter()
            .map(|p| {
                let abs = manifest_dir.join(&p);
                abs.to_string_lossy().into_owned()
            })
            .collect();

        Ok(Manifest {
            provides: raw.provides,
            version_str: raw.version_str,
            version,
            checksum: raw.checksum,
            licence: raw.licence,
            tarball: raw.tarball,
            meta: raw.meta,
            service_dir: raw.service_dir,
            profiles: raw.profiles,
            commands,
            manifest_dir,
            cache_dir,
            id,
        })
    }

    /// The resolved, on-disk working directory commands run in.
    pub fn working_dir(&self) -> PathBuf {
        PathBuf::from(
            self.commands
                .working_dir
                .as_deref()
                .unwrap_or_else(|| self.cache_dir.to_str().unwrap_or(".")),
        )
    }

    /// Construct the synthetic multi-package request manifest. Name is
    /// always `"packages"`, version zero, `meta = true`; its
    /// `default` profile depends on every requested package at the "latest"
    /// sentinel constraint.
    pub fn synthetic_request(packages: &[String], cache_root: &Path) -> Self {
        let deps: Vec<Dep> = packages
            .iter()
            .map(|p| Dep(p.clone(), LATEST_SENTINEL.to_string()))
            .collect();

        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Profile { deps });

        let provides = "packages".to_string();
        let version_str = "0.0.0".to_string();
        let version = Version::new(0, 0, 0);
        let id = format!("{provides} {version_str}");
        let cache_dir = cache_root.join(&provides).join(&version_str);

        Manifest {
            provides,
            version_str,
            version,
            checksum: String::new(),
            licence: String::new(),
            tarball: String::new(),
            meta: true,
            service_dir: None,
            profiles,
            commands: Commands {
                working_dir: Some(cache_dir.to_string_lossy().into_owned()),
                ..Commands::default()
            },
            manifest_dir: cache_dir.clone(),
            cache_dir,
            id,
        }
    }

    /// The synthetic "world" manifest returned by `StateDB::meta()` — every
    /// package in `world` as a dependency of a `default` profile, version
    /// stamped with `last_update`'s Unix timestamp.
    pub fn world_meta(world: &HashMap<String, String>, last_update_unix: i64, cache_root: &Path) -> Self {
        let deps: Vec<Dep> = world
            .iter()
            .map(|(name, constraint)| Dep(name.clone(), constraint.clone()))
            .collect();

        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Profile { deps });

        let provides = "world".to_string();
        let version_str = last_update_unix.to_string();
        let version = Version::new(0, 0, 0);
        let id = format!("{provides} {version_str}");
        let cache_dir = cache_root.join(&provides).join(&version_str);

        Manifest {
            provides,
            version_str,
            version,
            checksum: String::new(),
            licence: String::new(),
            tarball: String::new(),
            meta: true,
            service_dir: None,
            profiles,
            commands: Commands {
                working_dir: Some(cache_dir.to_string_lossy().into_owned()),
                ..Commands::default()
            },
            manifest_dir: cache_dir.clone(),
            cache_dir,
            id,
        }
    }
}

/// Join `base` with `rel` and normalise away `.`/`..` components without
/// touching the filesystem (the path need not exist yet at load time).
pub fn normalize_join(base: &Path, rel: &str) -> PathBuf {
    let joined = base.join(rel);
    let mut out = PathBuf::new();

    for component in joined.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                out.pop();
            }
            CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(MANIFEST_FILENAME);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn derives_id_and_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
provides = "app-utils"
version = "1.0.3"
checksum = "deadbeef"
licence = "MIT"
tarball = "https://example.com/app-utils-1.0.3.tar.gz"
"#,
        );

        let m = Manifest::load(&path, cache_root.path()).unwrap();
        assert_eq!(m.id, "app-utils 1.0.3");
        assert_eq!(m.cache_dir, cache_root.path().join("app-utils").join("1.0.3"));
    }

    #[test]
    fn rejects_invalid_dep() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
provides = "sample-app"
version = "1.0.0"
checksum = "deadbeef"
licence = "MIT"
tarball = "https://example.com/t.tar.gz"

[profiles.default]
deps = [["", ">=1.0"]]
"#,
        );

        let err = Manifest::load(&path, cache_root.path()).unwrap_err();
        assert!(matches!(err, VinError::InvalidDep(_)));
    }

    #[test]
    fn rejects_working_dir_escape() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
provides = "evil"
version = "1.0.0"
checksum = "deadbeef"
licence = "MIT"
tarball = "https://example.com/t.tar.gz"

[commands]
working_dir = "../../etc"
"#,
        );

        let err = Manifest::load(&path, cache_root.path()).unwrap_err();
        assert!(matches!(err, VinError::WorkingDirEscape { .. }));
    }

    #[test]
    fn rejects_invalid_version() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
provides = "sample-app"
version = "not-a-version"
checksum = "deadbeef"
licence = "MIT"
tarball = "https://example.com/t.tar.gz"
"#,
        );

        let err = Manifest::load(&path, cache_root.path()).unwrap_err();
        assert!(matches!(err, VinError::ManifestParse { .. }));
    }

    #[test]
    fn default_command_stages() {
        let commands = Commands::default();
        let stages = commands.stages();
        assert_eq!(stages[0], "./configure {{ .ConfigureFlags }}");
        assert_eq!(stages[1], "make {{ .MakeOpts }}");
        assert_eq!(stages[2], "make install {{ .MakeOpts }}");
    }
}
