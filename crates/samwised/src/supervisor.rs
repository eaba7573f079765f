// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wires the reliability engine together: opens the PKV-backed buffer, spins
//! up one BBW reactor per configured backend, binds them to a dispatcher,
//! and hands back the handles the front door and admin surface need.
//!
//! Every reactor here (`buf::run_buffer`, `BackendWorker::run`,
//! `Dispatcher::run`) is spawned as its own `tokio` task and talks to its
//! neighbors only through the `mpsc`/`oneshot` channels built here, per
//! spec §5's "no shared mutable state across reactor boundaries".

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use tokio::sync::mpsc;

use samwise_core::backend::{BackendSpec, BackendWorker};
use samwise_core::buf::{Buffer, RetryPolicy};
use samwise_core::config::Config;
use samwise_core::dispatch::{BackendHandle, DispCommand, Dispatcher};
use samwise_core::metrics::{BackendMetrics, BufMetrics};
use samwise_rmq::RmqBackend;
use samwise_store::{Pkv, PkvOptions};

use crate::error::DaemonError;

/// A running backend, as far as the admin surface is concerned.
pub struct BackendSnapshot {
    pub name: String,
    pub metrics: Arc<BackendMetrics>,
    pub state: Arc<AtomicU8>,
}

/// Everything built and spawned by [`build`]: the dispatcher's inbound
/// channel (for the front door) and the read-only handles the admin
/// surface reports from.
pub struct Supervisor {
    pub disp_commands: mpsc::Sender<DispCommand>,
    pub buf_metrics: Arc<BufMetrics>,
    pub backends: Vec<BackendSnapshot>,
}

const BUF_COMMAND_QUEUE: usize = 1024;
const RESEND_QUEUE: usize = 1024;
const DISP_COMMAND_QUEUE: usize = 1024;
const BACKEND_EVENT_QUEUE: usize = 1024;

/// Open the buffer, build the backend fleet, wire the dispatcher, and spawn
/// every reactor as its own task.
pub fn build(config: &Config) -> Result<Supervisor, DaemonError> {
    let pkv_opts = PkvOptions {
        map_size: config.buffer.map_size_bytes as usize,
    };
    let pkv = Pkv::open(&config.buffer.home, &config.buffer.file, pkv_opts)?;
    let buffer = Buffer::open(pkv, RetryPolicy::from(&config.buffer))?;
    let buf_metrics = buffer.metrics();

    let (buf_tx, buf_rx) = mpsc::channel(BUF_COMMAND_QUEUE);
    let (resend_tx, mut resend_rx) = mpsc::channel(RESEND_QUEUE);
    tokio::spawn(samwise_core::buf::run_buffer(buffer, buf_rx, resend_tx));

    let (events_tx, mut events_rx) = mpsc::channel(BACKEND_EVENT_QUEUE);
    let mut fleet = Vec::with_capacity(config.backends.len());
    let mut backends = Vec::with_capacity(config.backends.len());

    for (index, backend_config) in config.backends.iter().enumerate() {
        let spec = BackendSpec {
            id: 1u64 << index,
            name: backend_config.name.clone(),
            tries: backend_config.tries,
            interval_ms: backend_config.interval_ms,
        };
        let backend = RmqBackend::new(backend_config);
        let worker = BackendWorker::new(spec, backend, events_tx.clone());

        backends.push(BackendSnapshot {
            name: worker.name().to_string(),
            metrics: worker.metrics(),
            state: worker.shared_state(),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(backend_config.queue_capacity);
        fleet.push(BackendHandle::new(worker.id(), worker.name(), cmd_tx, worker.metrics()));
        tokio::spawn(worker.run(cmd_rx));
    }
    drop(events_tx);

    let (disp_tx, disp_rx) = mpsc::channel(DISP_COMMAND_QUEUE);
    let dispatcher = Dispatcher::new(fleet, buf_tx);
    tokio::spawn(dispatcher.run(disp_rx));

    let forward_tx = disp_tx.clone();
    tokio::spawn(async move {
        while let Some(resend) = resend_rx.recv().await {
            if forward_tx.send(DispCommand::Resend(resend)).await.is_err() {
                return;
            }
        }
    });

    let forward_tx = disp_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if forward_tx.send(DispCommand::Backend(event)).await.is_err() {
                return;
            }
        }
    });

    Ok(Supervisor {
        disp_commands: disp_tx,
        buf_metrics,
        backends,
    })
}
