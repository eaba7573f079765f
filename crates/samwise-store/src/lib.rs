// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PKV — an ordered, integer-keyed, transactional key-value store.
//!
//! Storage-engine-agnostic in spirit (per spec §4.1, "any ordered durable kv
//! engine with integer-keyed b-tree semantics suffices"); this
//! implementation is backed by [`heed`], the LMDB bindings also used
//! elsewhere in this codebase's lineage for ordered, cursor-walkable,
//! crash-safe storage. LMDB's single-writer, copy-on-write B-tree gives
//! "recovers from a prior uncommitted transaction" and "durable on commit"
//! for free: a crash mid-transaction never advances the readable root page.

mod error;
mod pkv;

pub use error::StoreError;
pub use pkv::{Pkv, PkvOptions, Sibling, Txn};
