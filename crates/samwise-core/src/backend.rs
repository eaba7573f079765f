// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The broker backend worker (BBW): a connection-lifecycle state machine
//! (§4.4.1) wrapped around a transport-agnostic [`Backend`] trait, so
//! `samwise-rmq`'s AMQP client and any test double drive the same reactor.
//!
//! [`BackendWorker`] owns one connection's `in_flight` map and runs as its
//! own `tokio` task (§5): a `BackendCommand` inbound channel plus whatever
//! polling the concrete `Backend` needs to surface confirms. The state
//! machine and in-flight bookkeeping are generic over `B: Backend`; only the
//! wire-level connect/publish/poll/rpc calls are transport-specific.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::metrics::BackendMetrics;
use crate::record::BufferRecord;
use crate::stored::StoredPublish;
use samwise_wire::protocol::RpcRequest;

/// One drained confirm frame: `BASIC_ACK(delivery_tag, multiple)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirm {
    pub delivery_tag: u64,
    pub multiple: bool,
}

/// The transport-specific half of a BBW: everything [`BackendWorker`] needs
/// from a concrete broker client. A failed `connect`/`publish`/`poll_confirms`/
/// `rpc` call is always treated as a wire error by the worker; a backend
/// implementation should not retry internally.
#[async_trait]
pub trait Backend: Send {
    /// Operator-facing name, from config.
    fn name(&self) -> &str;

    /// Open the connection, authenticate, open a publish channel and a
    /// separate RPC channel, enable publisher confirms.
    async fn connect(&mut self) -> Result<(), CoreError>;

    /// Publish one message at confirm sequence `seq`. The worker assigns
    /// `seq` and tracks `in_flight`; the backend just emits the wire
    /// operation.
    async fn publish(&mut self, seq: u64, publish: &StoredPublish) -> Result<(), CoreError>;

    /// Block until at least one confirm frame is available, or a wire-level
    /// error/heartbeat timeout occurs. Returns every confirm drained in one
    /// call (spec §4.4.3: "drain all buffered frames").
    async fn poll_confirms(&mut self) -> Result<Vec<Confirm>, CoreError>;

    /// Run an exchange management RPC on the dedicated RPC channel.
    async fn rpc(&mut self, request: &RpcRequest) -> Result<(), CoreError>;

    /// Best-effort teardown before a reconnect attempt or shutdown.
    async fn close(&mut self);
}

/// Connection lifecycle state (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Dead,
}

impl BackendState {
    fn as_u8(self) -> u8 {
        match self {
            BackendState::Disconnected => 0,
            BackendState::Connecting => 1,
            BackendState::Connected => 2,
            BackendState::Draining => 3,
            BackendState::Dead => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackendState::Connecting,
            2 => BackendState::Connected,
            3 => BackendState::Draining,
            4 => BackendState::Dead,
            _ => BackendState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Disconnected => "disconnected",
            BackendState::Connecting => "connecting",
            BackendState::Connected => "connected",
            BackendState::Draining => "draining",
            BackendState::Dead => "dead",
        }
    }
}

/// Events a BBW reactor emits towards the dispatcher.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// `backend_id` confirmed `key`.
    Ack { backend_id: u64, key: i32 },
    /// The connection dropped; BUF's retry timer is the only recovery path
    /// for messages already in flight on it.
    ConnectionLoss { name: String },
    /// Reconnect attempts are exhausted; the backend is permanently gone.
    Kill { name: String },
    /// A fresh connection replaced a prior one.
    Reconnected { name: String },
}

/// Commands a BBW reactor accepts.
#[derive(Debug)]
pub enum BackendCommand {
    Publish { key: i32, publish: StoredPublish },
    Rpc { request: RpcRequest, reply: tokio::sync::oneshot::Sender<Result<(), CoreError>> },
    Shutdown,
}

/// Static identity and reconnect policy for one configured backend.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    /// Single set bit within the 64-bit `be_acks` mask (§3); assigned as
    /// `1 << configuration_index` when the fleet is built, never an
    /// arbitrary integer.
    pub id: u64,
    pub name: String,
    pub tries: i32,
    pub interval_ms: u64,
}

/// The BBW reactor: connection state machine, `in_flight` map, and the
/// `tokio` task loop driving a concrete [`Backend`].
pub struct BackendWorker<B: Backend> {
    spec: BackendSpec,
    backend: B,
    state: BackendState,
    reconnect_tries_left: i32,
    next_seq: u64,
    /// FIFO by seq (BTreeMap preserves key order); spec §4.4.1 requires
    /// `multiple=true` acks to drain everything `<= delivery_tag`.
    in_flight: BTreeMap<u64, i32>,
    metrics: std::sync::Arc<BackendMetrics>,
    shared_state: Arc<AtomicU8>,
    events: mpsc::Sender<BackendEvent>,
}

impl<B: Backend> BackendWorker<B> {
    pub fn new(spec: BackendSpec, backend: B, events: mpsc::Sender<BackendEvent>) -> Self {
        let reconnect_tries_left = spec.tries;
        Self {
            spec,
            backend,
            state: BackendState::Disconnected,
            reconnect_tries_left,
            next_seq: 1,
            in_flight: BTreeMap::new(),
            metrics: std::sync::Arc::new(BackendMetrics::default()),
            shared_state: Arc::new(AtomicU8::new(BackendState::Disconnected.as_u8())),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn metrics(&self) -> std::sync::Arc<BackendMetrics> {
        self.metrics.clone()
    }

    /// A cell the admin surface can poll for this worker's connection state
    /// after `run` has taken ownership of `self`.
    pub fn shared_state(&self) -> Arc<AtomicU8> {
        self.shared_state.clone()
    }

    fn set_state(&mut self, state: BackendState) {
        self.state = state;
        self.shared_state.store(state.as_u8(), Ordering::Relaxed);
    }

    /// Drive `Disconnected -> Connecting -> Connected | Disconnected | Dead`
    /// once. Returns `true` if the attempt left the worker `Connected`.
    pub async fn try_connect(&mut self) -> bool {
        if self.reconnect_tries_left == 0 && self.spec.tries >= 0 {
            self.set_state(BackendState::Dead);
            let _ = self.events.send(BackendEvent::Kill { name: self.spec.name.clone() }).await;
            return false;
        }
        self.set_state(BackendState::Connecting);
        match self.backend.connect().await {
            Ok(()) => {
                self.set_state(BackendState::Connected);
                self.next_seq = 1;
                self.in_flight.clear();
                self.reconnect_tries_left = self.spec.tries;
                self.metrics.record_reconnect();
                let _ = self
                    .events
                    .send(BackendEvent::Reconnected { name: self.spec.name.clone() })
                    .await;
                true
            }
            Err(err) => {
                tracing::warn!(backend = %self.spec.name, error = %err, "connect failed");
                if self.spec.tries >= 0 {
                    self.reconnect_tries_left -= 1;
                }
                if self.reconnect_tries_left == 0 && self.spec.tries >= 0 {
                    self.set_state(BackendState::Dead);
                    let _ = self
                        .events
                        .send(BackendEvent::Kill { name: self.spec.name.clone() })
                        .await;
                } else {
                    self.set_state(BackendState::Disconnected);
                }
                false
            }
        }
    }

    /// Publish a message if `Connected`; otherwise drop it with a log line
    /// per spec §4.4.1 ("publish requests are dropped and NOT acked").
    pub async fn publish(&mut self, key: i32, publish: &StoredPublish) {
        if self.state != BackendState::Connected {
            tracing::debug!(backend = %self.spec.name, key, state = ?self.state, "dropping publish: not connected");
            return;
        }
        let seq = self.next_seq;
        match self.backend.publish(seq, publish).await {
            Ok(()) => {
                self.next_seq += 1;
                self.in_flight.insert(seq, key);
                self.metrics.record_published();
            }
            Err(err) => {
                tracing::warn!(backend = %self.spec.name, error = %err, "publish failed, draining");
                self.transition_to_draining().await;
            }
        }
    }

    pub async fn rpc(&mut self, request: &RpcRequest) -> Result<(), CoreError> {
        if self.state != BackendState::Connected {
            return Err(CoreError::NoBrokerAvailable);
        }
        let result = self.backend.rpc(request).await;
        self.metrics.record_rpc(result.is_ok());
        result
    }

    async fn drain_confirm(&mut self, confirm: Confirm) {
        let keys: Vec<i32> = if confirm.multiple {
            let tag = confirm.delivery_tag;
            let drained: Vec<u64> = self
                .in_flight
                .range(..=tag)
                .map(|(seq, _)| *seq)
                .collect();
            drained
                .into_iter()
                .filter_map(|seq| self.in_flight.remove(&seq))
                .collect()
        } else {
            self.in_flight
                .remove(&confirm.delivery_tag)
                .into_iter()
                .collect()
        };
        for key in keys {
            self.metrics.record_confirmed();
            let _ = self
                .events
                .send(BackendEvent::Ack { backend_id: self.spec.id, key })
                .await;
        }
    }

    async fn transition_to_draining(&mut self) {
        if self.state == BackendState::Connected {
            self.set_state(BackendState::Draining);
            self.backend.close().await;
            let _ = self
                .events
                .send(BackendEvent::ConnectionLoss { name: self.spec.name.clone() })
                .await;
        }
    }

    /// Run the reactor loop: commands from the dispatcher, confirms from
    /// the broker, and a reconnect timer, all as independent `select!`
    /// branches.
    ///
    /// Confirm polling used to run nested inside the timer branch, which
    /// meant a single tick blocked the whole loop on
    /// `backend.poll_confirms().await` until a confirm showed up —
    /// starving new `Publish`/`Rpc` commands for as long as the broker
    /// stayed quiet. Giving `poll_confirms` its own branch lets it await
    /// concurrently with command handling instead of serializing in front
    /// of it.
    pub async fn run(mut self, mut commands: mpsc::Receiver<BackendCommand>) {
        self.try_connect().await;
        let mut retry_timer = tokio::time::interval(std::time::Duration::from_millis(
            self.spec.interval_ms.max(1),
        ));
        retry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(BackendCommand::Publish { key, publish }) => {
                            self.publish(key, &publish).await;
                        }
                        Some(BackendCommand::Rpc { request, reply }) => {
                            let result = self.rpc(&request).await;
                            let _ = reply.send(result);
                        }
                        Some(BackendCommand::Shutdown) | None => {
                            self.backend.close().await;
                            return;
                        }
                    }
                }
                _ = retry_timer.tick() => {
                    if matches!(self.state, BackendState::Disconnected | BackendState::Draining) {
                        self.try_connect().await;
                    }
                }
                confirms = self.backend.poll_confirms(), if self.state == BackendState::Connected => {
                    match confirms {
                        Ok(confirms) => {
                            for confirm in confirms {
                                self.drain_confirm(confirm).await;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(backend = %self.spec.name, error = %err, "confirm poll failed");
                            self.transition_to_draining().await;
                        }
                    }
                }
            }
        }
    }
}

/// Read a [`BackendWorker::shared_state`] cell from outside the worker's
/// task, e.g. for an admin snapshot.
pub fn read_shared_state(cell: &Arc<AtomicU8>) -> BackendState {
    BackendState::from_u8(cell.load(Ordering::Relaxed))
}

/// Reconstructs the `in_flight` bit a resend needs: the distribution
/// policy's already-acked mask for a given `Live` record.
pub fn acked_mask(record: &BufferRecord) -> u64 {
    match record {
        BufferRecord::Live { acked_backends, .. } => *acked_backends,
        BufferRecord::AckOnly { acked_backends, .. } => *acked_backends,
        BufferRecord::Tombstone { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use samwise_wire::protocol::PublishProperties;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_publish() -> StoredPublish {
        StoredPublish {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
            properties: PublishProperties::default(),
            headers: vec![],
            payload: Bytes::from_static(b"x"),
        }
    }

    struct FlakyBackend {
        connect_failures_left: usize,
        confirms: Vec<Confirm>,
        connect_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn connect(&mut self) -> Result<(), CoreError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.connect_failures_left > 0 {
                self.connect_failures_left -= 1;
                Err(CoreError::NoBrokerAvailable)
            } else {
                Ok(())
            }
        }

        async fn publish(&mut self, _seq: u64, _publish: &StoredPublish) -> Result<(), CoreError> {
            Ok(())
        }

        async fn poll_confirms(&mut self) -> Result<Vec<Confirm>, CoreError> {
            Ok(std::mem::take(&mut self.confirms))
        }

        async fn rpc(&mut self, _request: &RpcRequest) -> Result<(), CoreError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn worker(backend: FlakyBackend, tries: i32) -> (BackendWorker<FlakyBackend>, mpsc::Receiver<BackendEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let spec = BackendSpec {
            id: 1,
            name: "flaky".into(),
            tries,
            interval_ms: 10,
        };
        (BackendWorker::new(spec, backend, tx), rx)
    }

    #[tokio::test]
    async fn connect_success_transitions_to_connected_and_emits_reconnected() {
        let backend = FlakyBackend {
            connect_failures_left: 0,
            confirms: vec![],
            connect_calls: Arc::new(AtomicUsize::new(0)),
        };
        let (mut w, mut events) = worker(backend, -1);
        let shared = w.shared_state();
        assert!(w.try_connect().await);
        assert_eq!(w.state(), BackendState::Connected);
        assert_eq!(read_shared_state(&shared), BackendState::Connected);
        assert!(matches!(events.recv().await, Some(BackendEvent::Reconnected { .. })));
    }

    #[tokio::test]
    async fn exhausted_reconnect_tries_transitions_to_dead_and_emits_kill() {
        let backend = FlakyBackend {
            connect_failures_left: 1,
            confirms: vec![],
            connect_calls: Arc::new(AtomicUsize::new(0)),
        };
        let (mut w, mut events) = worker(backend, 1);
        assert!(!w.try_connect().await);
        assert_eq!(w.state(), BackendState::Dead);
        assert!(matches!(events.recv().await, Some(BackendEvent::Kill { .. })));
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_dropped_without_panicking() {
        let backend = FlakyBackend {
            connect_failures_left: 0,
            confirms: vec![],
            connect_calls: Arc::new(AtomicUsize::new(0)),
        };
        let (mut w, _events) = worker(backend, -1);
        assert_eq!(w.state(), BackendState::Disconnected);
        w.publish(7, &sample_publish()).await;
        assert!(w.in_flight.is_empty());
    }

    #[tokio::test]
    async fn multiple_confirm_drains_every_seq_at_or_below_tag() {
        let backend = FlakyBackend {
            connect_failures_left: 0,
            confirms: vec![],
            connect_calls: Arc::new(AtomicUsize::new(0)),
        };
        let (mut w, mut events) = worker(backend, -1);
        assert!(w.try_connect().await);
        let _ = events.recv().await;

        w.publish(1, &sample_publish()).await;
        w.publish(2, &sample_publish()).await;
        w.publish(3, &sample_publish()).await;
        assert_eq!(w.in_flight.len(), 3);

        w.drain_confirm(Confirm { delivery_tag: 2, multiple: true }).await;
        assert_eq!(w.in_flight.len(), 1);
        assert!(w.in_flight.contains_key(&3));

        let mut acked_keys = vec![];
        while let Ok(event) = events.try_recv() {
            if let BackendEvent::Ack { key, .. } = event {
                acked_keys.push(key);
            }
        }
        acked_keys.sort();
        assert_eq!(acked_keys, vec![1, 2]);
    }

    #[tokio::test]
    async fn single_confirm_drains_exactly_one_seq() {
        let backend = FlakyBackend {
            connect_failures_left: 0,
            confirms: vec![],
            connect_calls: Arc::new(AtomicUsize::new(0)),
        };
        let (mut w, mut events) = worker(backend, -1);
        assert!(w.try_connect().await);
        let _ = events.recv().await;

        w.publish(1, &sample_publish()).await;
        w.publish(2, &sample_publish()).await;
        w.drain_confirm(Confirm { delivery_tag: 1, multiple: false }).await;

        assert_eq!(w.in_flight.len(), 1);
        assert!(w.in_flight.contains_key(&2));
    }
}
