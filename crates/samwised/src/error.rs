// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon-level error taxonomy: everything that can go wrong wiring the
//! reliability engine together, distinct from [`samwise_core::CoreError`]
//! which is the engine's own runtime error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to load config: {0}")]
    Config(#[from] samwise_core::config::ConfigError),

    #[error("failed to open the buffer store: {0}")]
    Store(#[from] samwise_store::StoreError),

    #[error(transparent)]
    Core(#[from] samwise_core::CoreError),

    #[error("failed to bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] samwise_wire::WireError),

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
