// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The dispatcher (DISP): enforces the distribution policy and coordinates
//! BUF with the BBW fleet (§4.5). Runs as its own reactor task, receiving
//! [`DispCommand`]s from the client-facing front door and [`BackendEvent`]s
//! forwarded from every backend worker.

use tokio::sync::{mpsc, oneshot};

use crate::backend::{BackendCommand, BackendEvent};
use crate::buf::{BufCommand, ResendRequest};
use crate::error::CoreError;
use crate::metrics::BackendMetrics;
use crate::stored::StoredPublish;
use samwise_wire::protocol::{DistributionPolicy, PublishRequest, RpcRequest};

/// A live handle to one fleet member, as seen by the dispatcher: enough to
/// route commands and track connectivity without owning the connection.
pub struct BackendHandle {
    pub id: u64,
    pub name: String,
    pub commands: mpsc::Sender<BackendCommand>,
    metrics: std::sync::Arc<BackendMetrics>,
    connected: bool,
}

impl BackendHandle {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        commands: mpsc::Sender<BackendCommand>,
        metrics: std::sync::Arc<BackendMetrics>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            commands,
            metrics,
            connected: false,
        }
    }

    /// Enqueue a publish, shedding it if the backend's inbound queue is
    /// full (spec §5: "an implementation SHOULD cap them and shed the
    /// oldest unpublished requests ... when a bound is exceeded"). We shed
    /// the newest arrival rather than evicting from the channel (which
    /// only the owning `BackendWorker` can drain), but the effect on
    /// delivery is identical: the shed message is simply left for BUF's
    /// retry timer to republish, same as an evicted older one would be.
    fn try_publish(&self, key: i32, publish: StoredPublish) {
        match self.commands.try_send(BackendCommand::Publish { key, publish }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(backend = %self.name, key, "backend queue full, shedding publish");
                self.metrics.record_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Commands the dispatcher reactor accepts.
pub enum DispCommand {
    Accept {
        request: PublishRequest,
        reply: oneshot::Sender<Result<i32, CoreError>>,
    },
    Resend(ResendRequest),
    Backend(BackendEvent),
    Rpc {
        request: RpcRequest,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

/// Owns the ordered backend fleet and the round-robin cursor (§4.5).
pub struct Dispatcher {
    fleet: Vec<BackendHandle>,
    cursor: usize,
    buf_commands: mpsc::Sender<BufCommand>,
}

impl Dispatcher {
    pub fn new(fleet: Vec<BackendHandle>, buf_commands: mpsc::Sender<BufCommand>) -> Self {
        Self {
            fleet,
            cursor: 0,
            buf_commands,
        }
    }

    fn find_by_name(&mut self, name: &str) -> Option<&mut BackendHandle> {
        self.fleet.iter_mut().find(|h| h.name == name)
    }

    fn connected_indices(&self) -> Vec<usize> {
        self.fleet
            .iter()
            .enumerate()
            .filter(|(_, h)| h.connected)
            .map(|(i, _)| i)
            .collect()
    }

    /// §4.5.1: validate the policy, save durably, fan out to the selected
    /// backends, return the assigned key.
    pub async fn accept(&mut self, request: PublishRequest) -> Result<i32, CoreError> {
        let targets = self.select_targets(request.distribution)?;

        let publish = StoredPublish::from(&request);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.buf_commands
            .send(BufCommand::Save {
                distribution: request.distribution,
                publish: publish.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoreError::Fatal(buffer_closed()))?;
        let key = reply_rx
            .await
            .map_err(|_| CoreError::Fatal(buffer_closed()))??;

        for index in targets {
            self.fleet[index].try_publish(key, publish.clone());
        }

        Ok(key)
    }

    /// Resolve the set of fleet indices a distribution policy requires,
    /// advancing the round-robin cursor for `RoundRobin`.
    fn select_targets(&mut self, distribution: DistributionPolicy) -> Result<Vec<usize>, CoreError> {
        if self.fleet.is_empty() {
            return Err(CoreError::NoBrokerAvailable);
        }
        match distribution {
            DistributionPolicy::RoundRobin => {
                let connected = self.connected_indices();
                if connected.is_empty() {
                    return Err(CoreError::NoBrokerAvailable);
                }
                let len = self.fleet.len();
                for offset in 0..len {
                    let index = (self.cursor + offset) % len;
                    if self.fleet[index].connected {
                        self.cursor = (index + 1) % len;
                        return Ok(vec![index]);
                    }
                }
                Err(CoreError::NoBrokerAvailable)
            }
            DistributionPolicy::Redundant(n) => {
                let connected = self.connected_indices();
                // Accept even if fewer than n are connected right now
                // (§4.5.1): BUF's retry timer recovers the rest.
                Ok(connected.into_iter().take(n as usize).collect())
            }
        }
    }

    /// §4.5.2: resend to the next round-robin backend not already acked.
    pub async fn resend(&mut self, resend: ResendRequest) {
        let len = self.fleet.len();
        if len == 0 {
            return;
        }
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let handle = &self.fleet[index];
            if handle.connected && resend.already_acked_mask & handle.id == 0 {
                self.cursor = (index + 1) % len;
                handle.try_publish(resend.new_key, resend.publish);
                return;
            }
        }
        tracing::debug!(key = resend.new_key, "no eligible backend for resend; next tick will retry");
    }

    /// §4.5.3: connectivity/removal bookkeeping, and forwarding acks to BUF.
    pub async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Ack { backend_id, key } => {
                let _ = self
                    .buf_commands
                    .send(BufCommand::Ack { backend_id, key })
                    .await;
            }
            BackendEvent::ConnectionLoss { name } => {
                tracing::warn!(backend = %name, "connection lost");
                if let Some(handle) = self.find_by_name(&name) {
                    handle.connected = false;
                }
            }
            BackendEvent::Reconnected { name } => {
                if let Some(handle) = self.find_by_name(&name) {
                    handle.connected = true;
                }
            }
            BackendEvent::Kill { name } => {
                tracing::error!(backend = %name, "backend permanently dead, removing from fleet");
                self.fleet.retain(|h| h.name != name);
                if self.cursor >= self.fleet.len() {
                    self.cursor = 0;
                }
            }
        }
    }

    /// RPC fan-out: broadcast to every connected backend (or a named one),
    /// per the client request's `broker_name` field.
    pub async fn rpc(&mut self, broker_name: Option<&str>, request: RpcRequest) -> Result<(), CoreError> {
        let targets: Vec<usize> = match broker_name {
            Some(name) => self
                .fleet
                .iter()
                .enumerate()
                .filter(|(_, h)| h.name == name)
                .map(|(i, _)| i)
                .collect(),
            None => (0..self.fleet.len()).collect(),
        };
        if targets.is_empty() {
            return Err(CoreError::NoBrokerAvailable);
        }
        let mut last_err = None;
        for index in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            let handle = &self.fleet[index];
            if handle
                .commands
                .send(BackendCommand::Rpc {
                    request: request.clone(),
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                continue;
            }
            if let Ok(Err(err)) = reply_rx.await {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run the reactor loop.
    pub async fn run(mut self, mut commands: mpsc::Receiver<DispCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                DispCommand::Accept { request, reply } => {
                    let result = self.accept(request).await;
                    let _ = reply.send(result);
                }
                DispCommand::Resend(resend) => self.resend(resend).await,
                DispCommand::Backend(event) => self.handle_backend_event(event).await,
                DispCommand::Rpc { request, reply } => {
                    let broker_name = match &request {
                        RpcRequest::ExchangeDeclare { broker_name, .. } => broker_name.clone(),
                        RpcRequest::ExchangeDelete { broker_name, .. } => broker_name.clone(),
                    };
                    let result = self.rpc(broker_name.as_deref(), request).await;
                    let _ = reply.send(result);
                }
            }
        }
    }
}

fn buffer_closed() -> samwise_store::StoreError {
    samwise_store::StoreError::Corrupt("buffer reactor channel closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use samwise_wire::protocol::PublishProperties;
    use std::sync::Arc;

    fn sample_request(distribution: DistributionPolicy) -> PublishRequest {
        PublishRequest {
            distribution,
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
            properties: PublishProperties::default(),
            headers: vec![],
            payload: Bytes::from_static(b"x"),
        }
    }

    fn buf_always_ok() -> (mpsc::Sender<BufCommand>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<BufCommand>(16);
        let handle = tokio::spawn(async move {
            let mut next_key = 1;
            while let Some(cmd) = rx.recv().await {
                if let BufCommand::Save { reply, .. } = cmd {
                    let _ = reply.send(Ok(next_key));
                    next_key += 1;
                }
            }
        });
        (tx, handle)
    }

    #[tokio::test]
    async fn accept_with_empty_fleet_is_rejected() {
        let (buf_tx, _handle) = buf_always_ok();
        let mut disp = Dispatcher::new(vec![], buf_tx);
        let err = disp
            .accept(sample_request(DistributionPolicy::RoundRobin))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoBrokerAvailable));
    }

    #[tokio::test]
    async fn round_robin_with_no_connected_backend_is_rejected() {
        let (buf_tx, _handle) = buf_always_ok();
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let fleet = vec![BackendHandle::new(1, "b1", cmd_tx, Arc::new(BackendMetrics::default()))];
        let mut disp = Dispatcher::new(fleet, buf_tx);
        let err = disp
            .accept(sample_request(DistributionPolicy::RoundRobin))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoBrokerAvailable));
    }

    #[tokio::test]
    async fn round_robin_publishes_to_the_connected_backend_and_advances_cursor() {
        let (buf_tx, _handle) = buf_always_ok();
        let (cmd_tx1, mut cmd_rx1) = mpsc::channel(4);
        let (cmd_tx2, mut cmd_rx2) = mpsc::channel(4);
        let mut fleet = vec![
            BackendHandle::new(1, "b1", cmd_tx1, Arc::new(BackendMetrics::default())),
            BackendHandle::new(2, "b2", cmd_tx2, Arc::new(BackendMetrics::default())),
        ];
        fleet[0].connected = true;
        fleet[1].connected = true;
        let mut disp = Dispatcher::new(fleet, buf_tx);

        let key1 = disp
            .accept(sample_request(DistributionPolicy::RoundRobin))
            .await
            .unwrap();
        assert_eq!(key1, 1);
        assert!(matches!(cmd_rx1.try_recv(), Ok(BackendCommand::Publish { .. })));

        let key2 = disp
            .accept(sample_request(DistributionPolicy::RoundRobin))
            .await
            .unwrap();
        assert_eq!(key2, 2);
        assert!(matches!(cmd_rx2.try_recv(), Ok(BackendCommand::Publish { .. })));
    }

    #[tokio::test]
    async fn redundant_dispatches_to_fewer_than_n_if_that_is_all_thats_connected() {
        let (buf_tx, _handle) = buf_always_ok();
        let (cmd_tx1, mut cmd_rx1) = mpsc::channel(4);
        let (cmd_tx2, mut cmd_rx2) = mpsc::channel(4);
        let mut fleet = vec![
            BackendHandle::new(1, "b1", cmd_tx1, Arc::new(BackendMetrics::default())),
            BackendHandle::new(2, "b2", cmd_tx2, Arc::new(BackendMetrics::default())),
        ];
        fleet[0].connected = true;
        let mut disp = Dispatcher::new(fleet, buf_tx);

        let key = disp
            .accept(sample_request(DistributionPolicy::Redundant(2)))
            .await
            .unwrap();
        assert_eq!(key, 1);
        assert!(matches!(cmd_rx1.try_recv(), Ok(BackendCommand::Publish { .. })));
        assert!(cmd_rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn accept_sheds_publish_and_counts_it_when_backend_queue_is_full() {
        let (buf_tx, _handle) = buf_always_ok();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let metrics = Arc::new(BackendMetrics::default());
        let mut fleet = vec![BackendHandle::new(1, "b1", cmd_tx, metrics.clone())];
        fleet[0].connected = true;
        let mut disp = Dispatcher::new(fleet, buf_tx);

        // Fill the backend's one-deep queue directly, then accept — the
        // dispatcher must not block waiting for room.
        disp.fleet[0]
            .commands
            .try_send(BackendCommand::Publish {
                key: 0,
                publish: StoredPublish::from(&sample_request(DistributionPolicy::RoundRobin)),
            })
            .unwrap();

        let key = disp
            .accept(sample_request(DistributionPolicy::RoundRobin))
            .await
            .unwrap();
        assert_eq!(key, 1);
        assert_eq!(metrics.snapshot().dropped, 1);

        // The pre-filled command is still the only one queued; the shed
        // publish never displaced it.
        match cmd_rx.try_recv() {
            Ok(BackendCommand::Publish { key, .. }) => assert_eq!(key, 0),
            other => panic!("expected the pre-filled command, got {other:?}"),
        }
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn kill_event_removes_backend_from_fleet() {
        let (buf_tx, _handle) = buf_always_ok();
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let fleet = vec![BackendHandle::new(1, "b1", cmd_tx, Arc::new(BackendMetrics::default()))];
        let mut disp = Dispatcher::new(fleet, buf_tx);
        disp.handle_backend_event(BackendEvent::Kill { name: "b1".into() })
            .await;
        assert!(disp.fleet.is_empty());
    }
}
