// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PKV error taxonomy.

use thiserror::Error;

/// Errors surfaced by [`crate::Pkv`] and [`crate::Txn`].
///
/// `Io` and `Corrupt` are the two failure kinds spec §4.3.5 treats as
/// `Fatal` upstream in BUF: the current transaction is aborted and the
/// error propagates to the daemon's top-level supervisor for a clean
/// process restart.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists at the requested key / cursor position.
    #[error("no record at the requested key")]
    NotFound,

    /// The underlying storage engine reported an I/O failure.
    #[error("pkv io error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying storage engine reported a corrupt database.
    #[error("pkv corrupt: {0}")]
    Corrupt(String),
}

impl From<heed::Error> for StoreError {
    fn from(err: heed::Error) -> Self {
        match err {
            heed::Error::Io(e) => StoreError::Io(e),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}
