// SPDX-License-Identifier: MIT
//! The installation engine — the single-writer pipeline that turns a
//! resolved plan into prepared, patched, built, and installed packages,
//! updating the state store as it goes.
//!
//! Build commands run as `tokio::process::Command` with piped stdout/stderr
//! streamed line-by-line rather than collected and printed once. A
//! `tokio::sync::Mutex` guards the state store across the engine's entire
//! operation rather than per-step, so concurrent installs serialise instead
//! of interleaving.

use crate::config::HostConfig;
use crate::errors::VinError;
use crate::manifest::{Manifest, ManifestStore};
use crate::output::{self, OutputLine, OutputSender};
use crate::resolver::{Resolver, DEFAULT_PROFILE};
use crate::source;
use crate::state::StateDb;
use crate::template::{self, TemplateContext};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

const LOCK_WAIT_POLL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub packages: Vec<String>,
    pub version: Option<String>,
    pub force: bool,
}

pub struct Engine {
    store: Arc<ManifestStore>,
    state: Arc<Mutex<StateDb>>,
    host_config: Arc<RwLock<HostConfig>>,
    http_client: reqwest::Client,
    cache_root: PathBuf,
    svc_root: PathBuf,
}

impl Engine {
    pub fn new(
        store: Arc<ManifestStore>,
        state: Arc<Mutex<StateDb>>,
        host_config: Arc<RwLock<HostConfig>>,
        cache_root: PathBuf,
        svc_root: PathBuf,
    ) -> Self {
        Self {
            store,
            state,
            host_config,
            http_client: reqwest::Client::new(),
            cache_root,
            svc_root,
        }
    }

    /// Validates arity up front, then spawns the pipeline in the
    /// background and returns the line stream immediately — the caller
    /// (the RPC layer) forwards lines to its client as they arrive.
    pub fn install(self: &Arc<Self>, request: InstallRequest) -> Result<mpsc::Receiver<OutputLine>, VinError> {
        if request.packages.is_empty() {
            return Err(VinError::EmptyPackage);
        }
        if request.packages.len() > 1 && request.version.is_some() {
            return Err(VinError::MultiplePackagesWithVersion);
        }

        let (tx, rx) = output::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_install(request, tx.clone()).await {
                tx.tagged("error").send(&e.to_string()).await;
            }
        });

        Ok(rx)
    }

    /// Rebuilds the manifest store, streaming progress the same way an
    /// install does. Acquires the same process-wide mutex as `install` —
    /// the two must serialise, since a concurrent reload racing an
    /// in-flight install's synthetic meta-manifest swap would otherwise
    /// have its freshly built index silently discarded on the install's
    /// restore.
    pub fn reload(self: &Arc<Self>) -> mpsc::Receiver<OutputLine> {
        let (tx, rx) = output::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let sender = tx.tagged("reload");
            let _guard = engine.acquire_lock(&sender).await;

            sender.send("reloading manifest store").await;
            match engine.store.reload().await {
                Ok(()) => sender.send("reload complete").await,
                Err(e) => sender.send(&format!("reload failed: {e}")).await,
            }
        });
        rx
    }

    /// Blocks until the engine's process-wide mutex is free, emitting
    /// `"waiting for lock"` once per second while polling. Shared by
    /// `install` and `reload` so the two never run concurrently.
    async fn acquire_lock(&self, sender: &OutputSender) -> tokio::sync::MutexGuard<'_, StateDb> {
        loop {
            match self.state.try_lock() {
                Ok(guard) => return guard,
                Err(_) => {
                    sender.send("waiting for lock").await;
                    tokio::time::sleep(LOCK_WAIT_POLL).await;
                }
            }
        }
    }

    async fn run_install(&self, request: InstallRequest, tx: OutputSender) -> Result<(), VinError> {
        let setup = tx.tagged("setup");
        let mut guard = self.acquire_lock(&setup).await;

        let result = self.run_install_locked(&request, &tx, &mut guard).await;

        if let Err(e) = guard.write().await {
            warn!(err = %e, "failed to flush state db");
        }

        result
    }

    async fn run_install_locked(
        &self,
        request: &InstallRequest,
        tx: &OutputSender,
        state: &mut StateDb,
    ) -> Result<(), VinError> {
        let is_multi = request.packages.len() > 1;

        let plan = if is_multi {
            let synthetic = Arc::new(Manifest::synthetic_request(&request.packages, &self.cache_root));
            let root_id = synthetic.id.clone();
            self.store
                .with_temp_manifest(synthetic, || async {
                    let resolver = Resolver::new(&self.store);
                    resolver
                        .solve(DEFAULT_PROFILE, "packages", None)
                        .await
                        .map(|plan| (plan, root_id))
                })
                .await?
        } else {
            let root_pkg = &request.packages[0];
            let constraint = request
                .version
                .as_deref()
                .filter(|v| *v != "latest");
            let resolver = Resolver::new(&self.store);
            let plan = resolver.solve(DEFAULT_PROFILE, root_pkg, constraint).await?;
            let root_id = plan
                .last()
                .map(|m| m.id.clone())
                .unwrap_or_else(|| root_pkg.clone());
            (plan, root_id)
        };

        let (plan, root_id) = plan;
        let host_config = self.host_config.read().await.clone();

        let mut finalisers: Vec<Arc<Manifest>> = Vec::new();

        for task in &plan {
            let sender = tx.tagged(task.id.clone());

            if state.is_installed(&task.id) && !request.force {
                sender.send("skip: already installed").await;
                continue;
            }
            if task.meta {
                sender.send("skip: meta package").await;
                continue;
            }

            sender.send(&format!("preparing {}", task.id)).await;
            source::prepare(&self.http_client, task).await?;

            for patch in &task.commands.patches {
                sender.send(&format!("applying patch {patch}")).await;
                run_patch(patch, &task.working_dir(), &sender).await?;
            }

            let ctx = build_context(task, &host_config);
            for raw in task.commands.stages() {
                let expanded = template::expand(&raw, &ctx)?;
                sender.send(&format!("$ {expanded}")).await;
                run_command(&expanded, &task.working_dir(), task.commands.skip_env, &host_config, &sender).await?;
            }

            if let Some(service_dir) = &task.service_dir {
                if !service_dir.is_empty() {
                    sender.send(&format!("deploying service dir {service_dir}")).await;
                    deploy_service_dir(&task.manifest_dir, service_dir, &self.svc_root).await?;
                }
            }

            if task
                .commands
                .finaliser
                .as_deref()
                .map(|f| !f.is_empty())
                .unwrap_or(false)
            {
                finalisers.push(task.clone());
            }

            state.add_installed(&task.id, Utc::now());
        }

        for task in &finalisers {
            let sender = tx.tagged(task.id.clone());
            let ctx = build_context(task, &host_config);
            let raw = task.commands.finaliser.clone().unwrap_or_default();
            let expanded = template::expand(&raw, &ctx)?;
            sender.send(&format!("running finaliser: {expanded}")).await;
            run_command(&expanded, &task.working_dir(), task.commands.skip_env, &host_config, &sender).await?;
        }

        if !is_multi {
            let root_name = &request.packages[0];
            let constraint = match request.version.as_deref() {
                None | Some("latest") => crate::manifest::LATEST_SENTINEL.to_string(),
                Some(v) => v.to_string(),
            };
            state.add_world(root_name, &constraint);
        }

        info!(root = %root_id, tasks = plan.len(), "install complete");
        Ok(())
    }
}

fn build_context(task: &Manifest, host: &HostConfig) -> TemplateContext {
    let mut ctx = TemplateContext::new();
    ctx.set("ManifestDir", task.manifest_dir.to_string_lossy())
        .set("Provides", &task.provides)
        .set("VersionStr", &task.version_str)
        .set("WorkingDir", task.working_dir().to_string_lossy())
        .set("ConfigureFlags", &host.configure_flags)
        .set("MakeOpts", &host.make_opts)
        .set("CFlags", &host.cflags)
        .set("CXXFlags", &host.cxxflags);
    ctx
}

async fn run_patch(patch_path: &str, cwd: &Path, sender: &OutputSender) -> Result<(), VinError> {
    run_argv(&["patch".to_string(), "-p1".to_string(), "-i".to_string(), patch_path.to_string()], cwd, sender).await
}

async fn run_command(
    cmd: &str,
    cwd: &Path,
    skip_env: bool,
    host: &HostConfig,
    sender: &OutputSender,
) -> Result<(), VinError> {
    let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(VinError::EmptyCommand);
    }

    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(cwd);

    if skip_env {
        command.env_clear();
    } else {
        command.env("CFLAGS", &host.cflags).env("CXXFLAGS", &host.cxxflags);
    }

    spawn_and_stream(command, sender).await
}

async fn run_argv(argv: &[String], cwd: &Path, sender: &OutputSender) -> Result<(), VinError> {
    if argv.is_empty() {
        return Err(VinError::EmptyCommand);
    }
    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(cwd);
    spawn_and_stream(command, sender).await
}

async fn spawn_and_stream(mut command: tokio::process::Command, sender: &OutputSender) -> Result<(), VinError> {
    let display = format!("{command:?}");

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let out_sender = sender.clone();
    let err_sender = sender.clone();

    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            out_sender.send(&line).await;
        }
    });
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            err_sender.send(&line).await;
        }
    });

    let status = child.wait().await?;
    let _ = out_task.await;
    let _ = err_task.await;

    if !status.success() {
        return Err(VinError::CommandFailed {
            command: display,
            code: status.code(),
        });
    }

    Ok(())
}

/// Recursively copies `manifest_dir/service_dir` to
/// `svc_root/<basename(service_dir)>/…`. Directories are created at mode
/// 0700; symlinks are re-resolved to their canonical target rather than
/// copied as raw link text, since service directories are consumed by a
/// separate init system that expects real paths.
async fn deploy_service_dir(manifest_dir: &Path, service_dir: &str, svc_root: &Path) -> Result<(), VinError> {
    let src = manifest_dir.join(service_dir);
    let basename = Path::new(service_dir)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| std::ffi::OsString::from(service_dir));
    let dest = svc_root.join(basename);

    tokio::task::spawn_blocking(move || copy_service_tree(&src, &dest))
        .await
        .map_err(|e| VinError::Io(std::io::Error::other(e.to_string())))??;

    Ok(())
}

fn copy_service_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::symlink_metadata(src)?;

    if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o700))?;

        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_service_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        let resolved = std::fs::canonicalize(src).unwrap_or(target);
        let _ = std::fs::remove_file(dest);
        std::os::unix::fs::symlink(resolved, dest)?;
    } else {
        std::fs::copy(src, dest)?;
    }

    Ok(())
}
