// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! amuxd: the agent multiplexer daemon.
//!
//! Usage: `amuxd [--config <path>] [--foreground]`. The state dir holds
//! the pidfile, logs, and workspace directories; `AMUX_LOG` filters the
//! tracing output.

use amux_daemon::{Daemon, DaemonConfig, HostContainers, MemoryRepository};
use fs2::FileExt;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<PathBuf>,
    foreground: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args { config: None, foreground: false };
    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" => {
                let path = argv.next().ok_or("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--foreground" => args.foreground = true,
            "--help" => {
                println!("usage: amuxd [--config <path>] [--foreground]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(args)
}

fn init_tracing(config: &DaemonConfig, foreground: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_env("AMUX_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let file_appender = tracing_appender::rolling::daily(config.logs_dir(), "amuxd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false);
    if foreground {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(file_layer).init();
    }
    guard
}

/// Hold an exclusive lock on the pidfile for the daemon's lifetime.
fn lock_pidfile(config: &DaemonConfig) -> Result<std::fs::File, String> {
    std::fs::create_dir_all(&config.state_dir)
        .map_err(|e| format!("state dir {}: {}", config.state_dir.display(), e))?;
    let path = config.pidfile();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| format!("pidfile {}: {}", path.display(), e))?;
    file.try_lock_exclusive()
        .map_err(|_| format!("another amuxd already holds {}", path.display()))?;
    std::fs::write(&path, format!("{}\n", std::process::id()))
        .map_err(|e| format!("pidfile {}: {}", path.display(), e))?;
    Ok(file)
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("amuxd: {}", message);
            return ExitCode::from(2);
        }
    };
    let config = match DaemonConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("amuxd: {}", err);
            return ExitCode::from(2);
        }
    };

    let _pidfile = match lock_pidfile(&config) {
        Ok(file) => file,
        Err(message) => {
            eprintln!("amuxd: {}", message);
            return ExitCode::from(1);
        }
    };
    let _log_guard = init_tracing(&config, args.foreground);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("amuxd: runtime: {}", err);
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::from(1)
        }
    }
}

async fn serve(config: DaemonConfig) -> Result<(), String> {
    // Single-node wiring: in-memory repository, host-directory
    // containers. Heavier backends slot in behind the same traits.
    let repo = MemoryRepository::new();
    seed_dev_token(&repo);
    let containers = std::sync::Arc::new(HostContainers::new(config.workspace_root()));

    let daemon = Daemon::start(config, repo, containers)
        .await
        .map_err(|e| e.to_string())?;

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| e.to_string())?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| e.to_string())?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| e.to_string())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                info!("SIGHUP: reloading access policies");
                if let Err(err) = daemon.reload_policies() {
                    warn!(%err, "policy reload failed, keeping the previous set");
                }
            }
        }
    }

    daemon.shutdown().await;
    Ok(())
}

/// Out-of-the-box token so a fresh install is reachable; overridden the
/// moment a real repository backend is wired in.
fn seed_dev_token(repo: &MemoryRepository) {
    if let Ok(token) = std::env::var("AMUX_DEV_TOKEN") {
        let principal = amux_core::PrincipalId::from_string("usr-dev");
        repo.insert_token(token, principal);
        repo.insert_roles(principal, vec!["default".to_string()]);
        info!("dev token registered for usr-dev");
    }
}
