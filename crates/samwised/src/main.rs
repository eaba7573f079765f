// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `samwised` — the Samwise daemon binary.
//!
//! Wires the reliability engine (`samwise-core`, `samwise-store`,
//! `samwise-rmq`) to its two external surfaces: the client-facing front
//! door (spec §6.1) and the admin/observability surface (spec §6.5), then
//! waits for `SIGINT`/`SIGTERM`.
//!
//! ```bash
//! samwised --config /etc/samwise/samwise.toml
//! samwised --config ./samwise.toml --dry-run
//! ```

mod admin;
mod error;
mod frontend;
mod supervisor;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use samwise_core::config::Config;

/// Distinguished exit code for a `Fatal` PKV error (spec §7): a process
/// supervisor (systemd, docker restart policy) should restart on this code,
/// and crash recovery (spec §4.3.4) handles state on the next `open`.
pub const EXIT_FATAL: i32 = 70;

/// Samwise: a best-effort store-and-forward publishing gateway.
#[derive(Parser, Debug)]
#[command(name = "samwised")]
#[command(about = "Best-effort store-and-forward publishing gateway")]
#[command(version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "samwise.toml")]
    config: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the config and exit without starting any reactor.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, path = %args.config.display(), "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if args.dry_run {
        info!(path = %args.config.display(), "config valid, exiting (--dry-run)");
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start the tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => {
            // `std::process::exit` inside `frontend::fatal_shutdown` tears
            // down a fatal buffer error's process already; this branch
            // covers the front door/admin surface failing to bind at all.
            std::process::exit(code);
        }
    }
}

async fn run(config: Config) -> Result<(), i32> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting samwised");

    let built = supervisor::build(&config).map_err(|err| {
        error!(error = %err, "failed to wire the reliability engine");
        EXIT_FATAL
    })?;

    let shutdown = Arc::new(Notify::new());
    let admin_state = admin::AdminState {
        buf_metrics: built.buf_metrics,
        backends: Arc::new(built.backends),
    };

    let mut tasks = Vec::new();

    {
        let disp_commands = built.disp_commands.clone();
        let endpoint = config.endpoint.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = frontend::run(&endpoint, disp_commands, shutdown).await {
                error!(error = %err, "front door exited");
            }
        }));
    }

    if let Some(admin_endpoint) = config.admin_endpoint.clone() {
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = admin::run(&admin_endpoint, admin_state, shutdown).await {
                error!(error = %err, "admin surface exited");
            }
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.notify_waiters();

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
