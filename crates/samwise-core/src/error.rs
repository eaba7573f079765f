// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The error taxonomy from spec §7: what's reported to a client, what's an
//! internal signal, and what's `Fatal` (propagated to the nearest
//! supervisor for a process restart).

use thiserror::Error;

/// Errors the reliability engine can raise.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed client request. Reported to the client; the connection
    /// stays up.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// All backends required by the distribution policy are `Dead` or
    /// unreachable at accept time. Reported to the client.
    #[error("no broker available")]
    NoBrokerAvailable,

    /// The persistent buffer hit an unrecoverable storage error. Nothing is
    /// reported to individual clients — the save either committed or it
    /// didn't. The process should restart; crash recovery (§4.3.4) handles
    /// the rest.
    #[error("fatal storage error: {0}")]
    Fatal(#[from] samwise_store::StoreError),

    /// A BR was found in a shape inconsistent with the state machine
    /// invariants (e.g. a `Live` record with a malformed payload trailer).
    /// Always a bug, never a client-visible error.
    #[error("corrupt buffer record: {0}")]
    CorruptRecord(String),
}

impl CoreError {
    /// True for the two PKV failure kinds spec §4.3.5/§7 calls `Fatal`:
    /// the caller should abort the in-flight transaction and exit the
    /// process for a clean restart.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_) | CoreError::CorruptRecord(_))
    }
}
