// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Counters the admin surface reports (spec §6.5). Plain atomics, read with
//! `Relaxed` ordering: these are operator-facing gauges, not a
//! synchronization mechanism.

use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer-wide counters, owned by [`crate::buf::Buffer`] and shared behind
/// an `Arc` with the admin surface.
#[derive(Debug, Default)]
pub struct BufMetrics {
    /// Messages accepted via `save`.
    pub saved: AtomicU64,
    /// Messages fully acknowledged and removed from the buffer.
    pub acked: AtomicU64,
    /// Resends issued by the retry pass.
    pub resent: AtomicU64,
    /// Messages dropped after exhausting `buffer.max_retries`.
    pub retries_exhausted: AtomicU64,
    /// Records currently live in the buffer (`Live` + `AckOnly`).
    pub outstanding: AtomicU64,
}

impl BufMetrics {
    pub fn record_saved(&self) {
        self.saved.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_resent(&self) {
        self.resent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BufMetricsSnapshot {
        BufMetricsSnapshot {
            saved: self.saved.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`BufMetrics`], for rendering or serializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BufMetricsSnapshot {
    pub saved: u64,
    pub acked: u64,
    pub resent: u64,
    pub retries_exhausted: u64,
    pub outstanding: u64,
}

/// Per-backend counters, owned by each `BS` connection worker.
#[derive(Debug, Default)]
pub struct BackendMetrics {
    pub published: AtomicU64,
    pub confirmed: AtomicU64,
    pub nacked: AtomicU64,
    pub reconnects: AtomicU64,
    pub rpc_ok: AtomicU64,
    pub rpc_failed: AtomicU64,
    /// Publish commands shed because this backend's inbound queue was full
    /// (spec §5 backpressure SHOULD); BUF's retry timer recovers them.
    pub dropped: AtomicU64,
}

impl BackendMetrics {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirmed(&self) {
        self.confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc(&self, ok: bool) {
        if ok {
            self.rpc_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rpc_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BackendMetricsSnapshot {
        BackendMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            rpc_ok: self.rpc_ok.load(Ordering::Relaxed),
            rpc_failed: self.rpc_failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BackendMetricsSnapshot {
    pub published: u64,
    pub confirmed: u64,
    pub nacked: u64,
    pub reconnects: u64,
    pub rpc_ok: u64,
    pub rpc_failed: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buf_metrics_track_outstanding_across_save_ack_and_exhaustion() {
        let m = BufMetrics::default();
        m.record_saved();
        m.record_saved();
        m.record_acked();
        m.record_retries_exhausted();

        let snap = m.snapshot();
        assert_eq!(snap.saved, 2);
        assert_eq!(snap.acked, 1);
        assert_eq!(snap.retries_exhausted, 1);
        assert_eq!(snap.outstanding, 0);
    }

    #[test]
    fn backend_metrics_split_rpc_outcomes() {
        let m = BackendMetrics::default();
        m.record_rpc(true);
        m.record_rpc(false);
        m.record_rpc(false);

        let snap = m.snapshot();
        assert_eq!(snap.rpc_ok, 1);
        assert_eq!(snap.rpc_failed, 2);
    }

    #[test]
    fn backend_metrics_counts_dropped_publishes() {
        let m = BackendMetrics::default();
        m.record_dropped();
        m.record_dropped();
        assert_eq!(m.snapshot().dropped, 2);
    }
}
