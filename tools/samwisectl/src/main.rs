// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `samwisectl` — operator CLI for a running `samwised`.
//!
//! Speaks the admin surface's small binary protocol directly (spec §6.5,
//! `samwised::admin`): a one-byte command plus a 4-byte LE payload-length
//! field out, a one-byte status plus a 4-byte LE length plus a JSON body
//! back. No HTTP involved -- the admin surface is deliberately a bare TCP
//! listener, separate from the client front door.
//!
//! ```bash
//! samwisectl health
//! samwisectl metrics
//! samwisectl backends
//! samwisectl watch --interval 2
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use tabled::{Table, Tabled};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "samwisectl")]
#[command(about = "Samwise operator CLI")]
#[command(version)]
struct Args {
    /// samwised admin surface address
    #[arg(short, long, default_value = "127.0.0.1:9082")]
    admin: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show daemon health
    Health,
    /// Show buffer and per-backend counters
    Metrics,
    /// List the configured backend fleet and connection state
    Backends,
    /// Show health + metrics + backends together
    Status,
    /// Watch mode (continuous updates)
    Watch {
        /// Update interval in seconds
        #[arg(short, long, default_value = "2")]
        interval: u64,
    },
}

#[derive(Debug, thiserror::Error)]
enum CtlError {
    #[error("connecting to admin surface at {0}: {1}")]
    Connect(String, std::io::Error),
    #[error("admin i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("admin surface rejected the request (status {0})")]
    BadStatus(u8),
    #[error("decoding admin response: {0}")]
    Decode(#[from] serde_json::Error),
}

const CMD_HEALTH: u8 = 0x01;
const CMD_METRICS: u8 = 0x02;
const CMD_BACKENDS: u8 = 0x03;

const STATUS_OK: u8 = 0x00;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct BufMetricsSnapshot {
    saved: u64,
    acked: u64,
    resent: u64,
    retries_exhausted: u64,
    outstanding: u64,
}

#[derive(Debug, Deserialize)]
struct BackendMetricsSnapshot {
    published: u64,
    confirmed: u64,
    nacked: u64,
    reconnects: u64,
    rpc_ok: u64,
    rpc_failed: u64,
    dropped: u64,
}

#[derive(Debug, Deserialize)]
struct BackendReport {
    name: String,
    state: String,
    metrics: BackendMetricsSnapshot,
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    buffer: BufMetricsSnapshot,
    backends: Vec<BackendReport>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let result = match args.command {
        Commands::Health => cmd_health(&args.admin).await,
        Commands::Metrics => cmd_metrics(&args.admin).await,
        Commands::Backends => cmd_backends(&args.admin).await,
        Commands::Status => cmd_status(&args.admin).await,
        Commands::Watch { interval } => cmd_watch(&args.admin, interval).await,
    };

    if let Err(err) = result {
        eprintln!("{} {}", "Error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn request(admin: &str, command: u8) -> Result<Vec<u8>, CtlError> {
    let mut stream = TcpStream::connect(admin)
        .await
        .map_err(|err| CtlError::Connect(admin.to_string(), err))?;

    let mut frame = [0u8; 5];
    frame[0] = command;
    // The length field is reserved for future commands that take a body;
    // every current command is a bare GET.
    stream.write_all(&frame).await?;

    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let status = header[0];
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    if status != STATUS_OK {
        return Err(CtlError::BadStatus(status));
    }
    Ok(body)
}

async fn fetch_health(admin: &str) -> Result<HealthResponse, CtlError> {
    let body = request(admin, CMD_HEALTH).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn fetch_metrics(admin: &str) -> Result<MetricsResponse, CtlError> {
    let body = request(admin, CMD_METRICS).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn fetch_backends(admin: &str) -> Result<Vec<BackendReport>, CtlError> {
    let body = request(admin, CMD_BACKENDS).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn cmd_health(admin: &str) -> Result<(), CtlError> {
    let health = fetch_health(admin).await?;
    let status = if health.status == "ok" {
        health.status.green().bold()
    } else {
        health.status.red().bold()
    };
    println!("{}", "Samwise Health".cyan().bold());
    println!("  Status:  {}", status);
    println!("  Version: {}", health.version);
    Ok(())
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "Backend")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Published")]
    published: u64,
    #[tabled(rename = "Confirmed")]
    confirmed: u64,
    #[tabled(rename = "Nacked")]
    nacked: u64,
    #[tabled(rename = "Reconnects")]
    reconnects: u64,
    #[tabled(rename = "Dropped")]
    dropped: u64,
}

fn backend_rows(backends: &[BackendReport]) -> Vec<BackendRow> {
    backends
        .iter()
        .map(|b| BackendRow {
            name: b.name.clone(),
            state: colorize_state(&b.state),
            published: b.metrics.published,
            confirmed: b.metrics.confirmed,
            nacked: b.metrics.nacked,
            reconnects: b.metrics.reconnects,
            dropped: b.metrics.dropped,
        })
        .collect()
}

fn colorize_state(state: &str) -> String {
    match state {
        "connected" => state.green().to_string(),
        "dead" => state.red().bold().to_string(),
        "draining" | "disconnected" => state.yellow().to_string(),
        other => other.to_string(),
    }
}

async fn cmd_metrics(admin: &str) -> Result<(), CtlError> {
    let metrics = fetch_metrics(admin).await?;
    print_buffer_metrics(&metrics.buffer);
    println!();
    print_backend_table(&metrics.backends);
    Ok(())
}

fn print_buffer_metrics(buffer: &BufMetricsSnapshot) {
    println!("{}", "Buffer".cyan().bold());
    println!("  Saved:              {}", buffer.saved);
    println!("  Acked:              {}", buffer.acked);
    println!("  Resent:             {}", buffer.resent);
    println!(
        "  Retries exhausted:  {}",
        if buffer.retries_exhausted > 0 {
            buffer.retries_exhausted.to_string().red().to_string()
        } else {
            buffer.retries_exhausted.to_string()
        }
    );
    println!("  Outstanding:        {}", buffer.outstanding);
}

fn print_backend_table(backends: &[BackendReport]) {
    println!("{}", "Backends".cyan().bold());
    if backends.is_empty() {
        println!("  {}", "No backends configured".yellow());
        return;
    }
    let table = Table::new(backend_rows(backends)).to_string();
    println!("{table}");
}

async fn cmd_backends(admin: &str) -> Result<(), CtlError> {
    let backends = fetch_backends(admin).await?;
    print_backend_table(&backends);
    Ok(())
}

async fn cmd_status(admin: &str) -> Result<(), CtlError> {
    println!("{}", "Samwise Status".cyan().bold());
    println!("{}", "=".repeat(50));
    println!();
    cmd_health(admin).await?;
    println!();
    cmd_metrics(admin).await?;
    Ok(())
}

async fn cmd_watch(admin: &str, interval: u64) -> Result<(), CtlError> {
    println!(
        "{} (interval: {}s, Ctrl+C to stop)",
        "Watch Mode".cyan().bold(),
        interval
    );
    loop {
        print!("\x1B[2J\x1B[1;1H");
        println!("{}", "Samwise Admin Watch".cyan().bold());
        println!("{}", "=".repeat(50));

        if let Ok(health) = fetch_health(admin).await {
            let status = if health.status == "ok" {
                health.status.green()
            } else {
                health.status.red()
            };
            println!("Health: {status}");
        }
        if let Ok(metrics) = fetch_metrics(admin).await {
            println!(
                "Buffer: {} saved, {} acked, {} resent, {} exhausted, {} outstanding",
                metrics.buffer.saved,
                metrics.buffer.acked,
                metrics.buffer.resent,
                metrics.buffer.retries_exhausted,
                metrics.buffer.outstanding,
            );
            println!();
            print_backend_table(&metrics.backends);
        }

        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}
