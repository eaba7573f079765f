// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The `Pkv` handle and its single-writer `Txn`.

use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use heed::byteorder::BigEndian;
use heed::types::{Bytes, I32};
use heed::{Env, EnvOpenOptions};

use crate::error::StoreError;

type KeyCodec = I32<BigEndian>;
type ValueCodec = Bytes;
type Db = heed::Database<KeyCodec, ValueCodec>;

/// Tuning knobs for [`Pkv::open`].
#[derive(Debug, Clone, Copy)]
pub struct PkvOptions {
    /// Maximum size the memory-mapped data file may grow to.
    pub map_size: usize,
}

impl Default for PkvOptions {
    fn default() -> Self {
        Self {
            // 1 GiB ceiling; generous for a store-and-forward buffer and
            // cheap on 64-bit virtual address space.
            map_size: 1 << 30,
        }
    }
}

/// A handle to the durable ordered key-value store.
///
/// Opening twice on the same path from the same process is unsupported
/// (spec §5: "the process must hold at most one BUF at a time on a given
/// path"); `Pkv` is `Send + Sync` so it can be shared behind an `Arc` but
/// all write transactions still serialise through LMDB's single-writer
/// lock.
pub struct Pkv {
    env: Env,
    db: Db,
}

impl Pkv {
    /// Open (creating if absent) the PKV at `home/file`. Recovers
    /// automatically from any transaction left uncommitted by a prior
    /// crash: LMDB's copy-on-write root never advances past the last
    /// committed transaction, so there is nothing for us to replay.
    pub fn open(home: impl AsRef<Path>, file: impl AsRef<Path>, opts: PkvOptions) -> Result<Self, StoreError> {
        let home = home.as_ref();
        fs::create_dir_all(home)?;
        let path = home.join(file.as_ref());
        fs::create_dir_all(&path)?;

        tracing::info!(path = %path.display(), "opening pkv");

        // SAFETY: `map_size` bounds the memory map; Samwise never opens the
        // same path from more than one process concurrently (enforced by
        // the daemon holding a single `Pkv` per configured `buffer.home`).
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(opts.map_size)
                .max_dbs(1)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let db: Db = env.create_database(&mut wtxn, Some("samwise"))?;
        wtxn.commit()?;

        Ok(Self { env, db })
    }

    /// Begin a transaction. All three of BUF's handlers (save, ack, retry)
    /// use this uniformly — the spec doesn't require concurrent readers,
    /// and every path both reads and writes within the same handler.
    pub fn begin(&self) -> Result<Txn<'_>, StoreError> {
        let inner = self.env.write_txn()?;
        Ok(Txn {
            db: self.db,
            inner: Some(inner),
            cursor: Cursor::BeforeFirst,
        })
    }

    /// The resolved on-disk directory this store was opened at, for
    /// diagnostics.
    pub fn path(&self) -> PathBuf {
        self.env.path().to_path_buf()
    }
}

/// Direction for [`Txn::sibling`], relative to the transaction's current
/// cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sibling {
    Prev,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeFirst,
    At(i32),
}

/// A transaction holding an implicit cursor, positioned by the last
/// `get`/`sibling`/`put` call.
pub struct Txn<'p> {
    db: Db,
    inner: Option<heed::RwTxn<'p>>,
    cursor: Cursor,
}

impl<'p> Txn<'p> {
    fn inner(&self) -> &heed::RwTxn<'p> {
        self.inner.as_ref().expect("txn used after commit/abort")
    }

    fn inner_mut(&mut self) -> &mut heed::RwTxn<'p> {
        self.inner.as_mut().expect("txn used after commit/abort")
    }

    /// Position the cursor at `key` and return its value.
    pub fn get(&mut self, key: i32) -> Result<Vec<u8>, StoreError> {
        let value = self.db.get(self.inner(), &key)?;
        match value {
            Some(bytes) => {
                let owned = bytes.to_vec();
                self.cursor = Cursor::At(key);
                Ok(owned)
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Position the cursor at `key` without requiring a record to exist
    /// there. `sibling` is range-based off the cursor's key, not a
    /// lookup, so this lets a caller resume a scan from a key it just
    /// deleted (e.g. the retry pass walking past a record it dropped for
    /// retry-budget exhaustion) without re-`get`ting it first.
    pub fn seek(&mut self, key: i32) {
        self.cursor = Cursor::At(key);
    }

    /// The key the cursor currently sits at, if any.
    pub fn current_key(&self) -> Option<i32> {
        match self.cursor {
            Cursor::At(k) => Some(k),
            Cursor::BeforeFirst => None,
        }
    }

    /// Move to the sibling of the current cursor position and return its
    /// value. `Next` from the before-first position returns the lowest key
    /// in the store (used by the retry pass to start its scan).
    pub fn sibling(&mut self, dir: Sibling) -> Result<(i32, Vec<u8>), StoreError> {
        let found = match (dir, self.cursor) {
            (Sibling::Next, Cursor::BeforeFirst) => {
                self.db.iter(self.inner())?.next().transpose()?
            }
            (Sibling::Next, Cursor::At(key)) => self
                .db
                .range(self.inner(), &(Bound::Excluded(key), Bound::Unbounded))?
                .next()
                .transpose()?,
            (Sibling::Prev, Cursor::BeforeFirst) => None,
            (Sibling::Prev, Cursor::At(key)) => self
                .db
                .rev_range(self.inner(), &(Bound::Unbounded, Bound::Excluded(key)))?
                .next()
                .transpose()?,
        };

        match found {
            Some((key, bytes)) => {
                let owned = bytes.to_vec();
                self.cursor = Cursor::At(key);
                Ok((key, owned))
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Position the cursor at the highest key in the store and return its
    /// value. Used by crash recovery to seed `seq`/`last_stored` without a
    /// full forward scan.
    pub fn last(&mut self) -> Result<(i32, Vec<u8>), StoreError> {
        let found = self.db.rev_iter(self.inner())?.next().transpose()?;
        match found {
            Some((key, bytes)) => {
                let owned = bytes.to_vec();
                self.cursor = Cursor::At(key);
                Ok((key, owned))
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Upsert `value` at `key`; positions the cursor there.
    pub fn put(&mut self, key: i32, value: &[u8]) -> Result<(), StoreError> {
        self.db.put(self.inner_mut(), &key, value)?;
        self.cursor = Cursor::At(key);
        Ok(())
    }

    /// Replace the record at the current cursor key, keeping the key.
    pub fn update_replace_current(&mut self, value: &[u8]) -> Result<(), StoreError> {
        let key = self.current_key().ok_or(StoreError::NotFound)?;
        self.db.put(self.inner_mut(), &key, value)?;
        Ok(())
    }

    /// Delete the record at the current cursor key and insert `value` at
    /// `new_key`, moving the cursor there.
    pub fn update_by_key(&mut self, new_key: i32, value: &[u8]) -> Result<(), StoreError> {
        if let Some(old_key) = self.current_key() {
            self.db.delete(self.inner_mut(), &old_key)?;
        }
        self.db.put(self.inner_mut(), &new_key, value)?;
        self.cursor = Cursor::At(new_key);
        Ok(())
    }

    /// Delete the record at the current cursor position.
    pub fn del(&mut self) -> Result<(), StoreError> {
        let key = self.current_key().ok_or(StoreError::NotFound)?;
        self.db.delete(self.inner_mut(), &key)?;
        Ok(())
    }

    /// Delete the record at an arbitrary key, independent of cursor
    /// position (used by the ack path to walk a tombstone chain backwards).
    pub fn del_key(&mut self, key: i32) -> Result<bool, StoreError> {
        Ok(self.db.delete(self.inner_mut(), &key)?)
    }

    /// Durability barrier: once this returns `Ok`, the writes are durable
    /// and visible to the next `Pkv::open`/`Txn::begin`.
    pub fn commit(mut self) -> Result<(), StoreError> {
        let inner = self.inner.take().expect("txn used after commit/abort");
        inner.commit()?;
        Ok(())
    }

    /// Discard every operation performed in this transaction.
    pub fn abort(mut self) {
        self.inner.take();
        // Dropping an uncommitted heed::RwTxn aborts it.
    }
}
