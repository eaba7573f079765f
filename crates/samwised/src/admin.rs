// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The admin/observability surface (spec §6.5): a small binary TCP protocol
//! -- one command byte plus a (currently unused) LE payload-length field,
//! answered with a status byte, an LE response length, and a JSON body.
//!
//! Kept deliberately separate from the client front door: an operator tool
//! should never be able to hold up or be confused with publish traffic.

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use samwise_core::backend::read_shared_state;
use samwise_core::metrics::{BackendMetricsSnapshot, BufMetrics, BufMetricsSnapshot};

use crate::error::DaemonError;
use crate::supervisor::BackendSnapshot;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    GetHealth = 0x01,
    GetMetrics = 0x02,
    GetBackends = 0x03,
}

impl Command {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Command::GetHealth),
            0x02 => Some(Command::GetMetrics),
            0x03 => Some(Command::GetBackends),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Status {
    Ok = 0x00,
    InvalidCommand = 0x01,
    InternalError = 0x02,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct BackendReport {
    name: String,
    state: &'static str,
    metrics: BackendMetricsSnapshot,
}

#[derive(Serialize)]
struct MetricsResponse {
    buffer: BufMetricsSnapshot,
    backends: Vec<BackendReport>,
}

/// Shared, read-only handles the admin surface reports from. Cheap to
/// clone: every field is already an `Arc`.
#[derive(Clone)]
pub struct AdminState {
    pub buf_metrics: Arc<BufMetrics>,
    pub backends: Arc<Vec<BackendSnapshot>>,
}

impl AdminState {
    fn backend_reports(&self) -> Vec<BackendReport> {
        self.backends
            .iter()
            .map(|backend| BackendReport {
                name: backend.name.clone(),
                state: read_shared_state(&backend.state).as_str(),
                metrics: backend.metrics.snapshot(),
            })
            .collect()
    }
}

/// Accept admin connections on `addr` until `shutdown` is notified.
pub async fn run(addr: &str, state: AdminState, shutdown: Arc<Notify>) -> Result<(), DaemonError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| DaemonError::Bind(addr.to_string(), err))?;
    info!(addr, "admin surface listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, state).await {
                                warn!(%peer, error = %err, "admin connection closed with an error");
                            }
                        });
                    }
                    Err(err) => error!(error = %err, "admin accept failed"),
                }
            }
            _ = shutdown.notified() => {
                info!("admin surface shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: AdminState) -> Result<(), DaemonError> {
    loop {
        let mut header = [0u8; 5];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(DaemonError::Io(err)),
        }
        let command = Command::from_u8(header[0]);
        // The payload-length field exists for forward compatibility with a
        // future command that takes arguments; every current command is a
        // bare GET with no body to read.

        let body = match command {
            Some(Command::GetHealth) => serde_json::to_vec(&HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
            }),
            Some(Command::GetMetrics) => serde_json::to_vec(&MetricsResponse {
                buffer: state.buf_metrics.snapshot(),
                backends: state.backend_reports(),
            }),
            Some(Command::GetBackends) => serde_json::to_vec(&state.backend_reports()),
            None => {
                write_frame(&mut stream, Status::InvalidCommand, br#"{"error":"invalid_command"}"#)
                    .await?;
                continue;
            }
        };

        match body {
            Ok(body) => write_frame(&mut stream, Status::Ok, &body).await?,
            Err(err) => {
                error!(error = %err, "failed to serialize admin response");
                write_frame(&mut stream, Status::InternalError, br#"{"error":"internal"}"#).await?;
            }
        }
    }
}

async fn write_frame(stream: &mut TcpStream, status: Status, body: &[u8]) -> Result<(), DaemonError> {
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    let mut header = [0u8; 5];
    header[0] = status as u8;
    header[1..5].copy_from_slice(&len.to_le_bytes());
    stream
        .write_all(&header)
        .await
        .map_err(|err| DaemonError::Bind("admin connection".to_string(), err))?;
    stream
        .write_all(body)
        .await
        .map_err(|err| DaemonError::Bind("admin connection".to_string(), err))?;
    Ok(())
}
