// SPDX-License-Identifier: MIT
//! `vin` — single binary dispatching on subcommand: `serve` runs the daemon;
//! `install`/`reload`/`version` are thin clients that dial the running
//! daemon's socket; `advise` is a pure local function with no daemon
//! involvement.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use vin::config::{self, HostConfig};
use vin::ipc::client::{reject_version_with_multiple_packages, DaemonClient};
use vin::ipc;

#[derive(Parser)]
#[command(name = "vin", about = "vin — source-based package manager daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level filter, e.g. "info", "debug", "vin=trace" (env: VIN_LOG).
    #[arg(long, env = "VIN_LOG", global = true)]
    log: Option<String>,

    /// Write logs to this file path (rotated daily), in addition to stdout.
    #[arg(long, env = "VIN_LOG_FILE", global = true)]
    log_file: Option<std::path::PathBuf>,

    /// Path to the daemon's Unix domain socket (env: VIN_SOCKET_ADDR).
    #[arg(long, env = "VIN_SOCKET_ADDR", global = true)]
    socket: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    ///
    /// Examples:
    ///   vin serve
    Serve,
    /// Install one or more packages.
    ///
    /// A version constraint (`-v`) is only valid with a single package.
    ///
    /// Examples:
    ///   vin install sample-app
    ///   vin install sample-app -v ">=1.2.0"
    ///   vin install sample-app user-lib -f
    Install {
        /// Package names to install.
        packages: Vec<String>,
        /// Version constraint for a single-package install.
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Reinstall even if already present in the state store.
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Rebuild the manifest store from the configured manifest roots.
    ///
    /// Examples:
    ///   vin reload
    Reload,
    /// Print the running daemon's build identification.
    ///
    /// Examples:
    ///   vin version
    Version,
    /// Print a sample host configuration for a fresh machine.
    ///
    /// Pure local function — does not require a running daemon.
    ///
    /// Examples:
    ///   vin advise
    ///   vin advise > /etc/vinyl/vin.toml
    Advise,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(DaemonClient::socket_path_from_env);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(&socket_path).await?,
        Command::Install { packages, version, force } => {
            run_install(&socket_path, packages, version, force).await?
        }
        Command::Reload => run_reload(&socket_path).await?,
        Command::Version => run_version(&socket_path).await?,
        Command::Advise => run_advise(),
    }

    Ok(())
}

async fn run_serve(socket_path: &std::path::Path) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vin daemon starting");

    let daemon = vin::Daemon::bootstrap()
        .await
        .context("failed to bootstrap daemon")?;
    let daemon = std::sync::Arc::new(daemon);

    ipc::serve(daemon, socket_path)
        .await
        .context("daemon transport exited")?;

    Ok(())
}

async fn run_install(
    socket_path: &std::path::Path,
    packages: Vec<String>,
    version: Option<String>,
    force: bool,
) -> Result<()> {
    if packages.is_empty() {
        anyhow::bail!("{}", vin::VinError::EmptyPackage);
    }
    reject_version_with_multiple_packages(&packages, &version)?;

    let client = DaemonClient::new(socket_path.to_path_buf());
    let params = serde_json::json!({
        "packages": packages,
        "version": version,
        "force": force,
    });

    client
        .call_streaming("install", params, |line| println!("{line}"))
        .await
        .context("install failed")?;

    Ok(())
}

async fn run_reload(socket_path: &std::path::Path) -> Result<()> {
    let client = DaemonClient::new(socket_path.to_path_buf());
    client
        .call_streaming("reload", serde_json::json!({}), |line| println!("{line}"))
        .await
        .context("reload failed")?;
    Ok(())
}

async fn run_version(socket_path: &std::path::Path) -> Result<()> {
    let client = DaemonClient::new(socket_path.to_path_buf());
    let resp = client.version().await.context("version query failed")?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

fn run_advise() {
    let advised: HostConfig = config::advise();
    println!("# generated by `vin advise` at {}", chrono::Utc::now().to_rfc3339());
    println!("{}", advised.to_toml());
}

/// Initialise the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime. Falls back to stdout-only, with a
/// warning, if the log directory can't be created — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("vin.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
