// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The AMQP 0-9-1 broker backend worker, via `lapin`. Implements
//! `samwise_core::backend::Backend` so [`samwise_core::backend::BackendWorker`]
//! can drive a real broker connection through the same lifecycle state
//! machine the test double exercises.
//!
//! `lapin` resolves confirms per publish (one `PublisherConfirm` future per
//! `basic_publish` call) rather than handing back raw `basic.ack` frames, so
//! each publish spawns a short-lived task that awaits its own confirm and
//! forwards a [`Confirm`] onto an internal channel; `poll_confirms` just
//! drains that channel. Because a channel's publishes are confirmed in the
//! order they were sent (§4.4.2), the worker's own `seq` counter lines up
//! with AMQP's delivery-tag sequence and no tag bookkeeping is needed here.

mod properties;

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::{AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;

use samwise_core::backend::{Backend, Confirm};
use samwise_core::config::BackendConfig;
use samwise_core::error::CoreError;
use samwise_core::stored::StoredPublish;
use samwise_wire::protocol::RpcRequest;

/// Bound on the internal confirm-relay channel; one slot per in-flight
/// publish would be correct but this is deliberately generous instead,
/// since a full channel would stall a spawned confirm task, not drop a
/// message.
const CONFIRM_CHANNEL_CAPACITY: usize = 4096;

fn wire_err(context: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::Protocol(format!("{context}: {err}"))
}

fn to_uri(config: &BackendConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo = AMQPUserInfo {
        username: config.user.clone(),
        password: config.pass.clone(),
    };
    uri.query.heartbeat = Some(config.heartbeat_s);
    uri
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// One AMQP connection: a publish channel with confirms enabled, and a
/// separate channel reserved for RPC (exchange management), per §4.4.4.
pub struct RmqBackend {
    name: String,
    uri: AMQPUri,
    connection: Option<Connection>,
    publish_channel: Option<Channel>,
    rpc_channel: Option<Channel>,
    confirm_tx: mpsc::Sender<Confirm>,
    confirm_rx: mpsc::Receiver<Confirm>,
}

impl RmqBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::channel(CONFIRM_CHANNEL_CAPACITY);
        Self {
            name: config.name.clone(),
            uri: to_uri(config),
            connection: None,
            publish_channel: None,
            rpc_channel: None,
            confirm_tx,
            confirm_rx,
        }
    }

    fn connection_properties() -> ConnectionProperties {
        ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio)
    }
}

#[async_trait]
impl Backend for RmqBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), CoreError> {
        let connection = Connection::connect_uri(self.uri.clone(), Self::connection_properties())
            .await
            .map_err(|err| wire_err("connect", err))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|err| wire_err("open publish channel", err))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| wire_err("confirm_select", err))?;

        let rpc_channel = connection
            .create_channel()
            .await
            .map_err(|err| wire_err("open rpc channel", err))?;

        // A fresh connection starts a fresh delivery-tag sequence; any
        // confirms still sitting in the channel from a prior connection
        // would be misattributed, so drop them.
        let (confirm_tx, confirm_rx) = mpsc::channel(CONFIRM_CHANNEL_CAPACITY);
        self.confirm_tx = confirm_tx;
        self.confirm_rx = confirm_rx;
        self.connection = Some(connection);
        self.publish_channel = Some(publish_channel);
        self.rpc_channel = Some(rpc_channel);
        Ok(())
    }

    async fn publish(&mut self, seq: u64, publish: &StoredPublish) -> Result<(), CoreError> {
        let channel = self
            .publish_channel
            .as_ref()
            .ok_or(CoreError::NoBrokerAvailable)?;

        let basic_properties = properties::to_basic_properties(&publish.properties, &publish.headers);
        let options = BasicPublishOptions {
            mandatory: publish.mandatory,
            immediate: publish.immediate,
        };

        let confirmation = channel
            .basic_publish(
                &publish.exchange,
                &publish.routing_key,
                options,
                &publish.payload,
                basic_properties,
            )
            .await
            .map_err(|err| wire_err("basic_publish", err))?;

        let confirm_tx = self.confirm_tx.clone();
        tokio::spawn(async move {
            match confirmation.await {
                Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                    let _ = confirm_tx
                        .send(Confirm {
                            delivery_tag: seq,
                            multiple: false,
                        })
                        .await;
                }
                Ok(Confirmation::Nack(_)) => {
                    tracing::warn!(seq, "broker nacked publish, awaiting resend via BUF retry");
                }
                Err(err) => {
                    tracing::warn!(seq, error = %err, "publisher confirm future failed");
                }
            }
        });
        Ok(())
    }

    async fn poll_confirms(&mut self) -> Result<Vec<Confirm>, CoreError> {
        let first = self
            .confirm_rx
            .recv()
            .await
            .ok_or_else(|| wire_err("poll_confirms", "confirm channel closed"))?;
        let mut confirms = vec![first];
        while let Ok(confirm) = self.confirm_rx.try_recv() {
            confirms.push(confirm);
        }
        Ok(confirms)
    }

    async fn rpc(&mut self, request: &RpcRequest) -> Result<(), CoreError> {
        let channel = self
            .rpc_channel
            .as_ref()
            .ok_or(CoreError::NoBrokerAvailable)?;
        match request {
            RpcRequest::ExchangeDeclare { exchange, kind, .. } => {
                channel
                    .exchange_declare(
                        exchange,
                        exchange_kind(kind),
                        ExchangeDeclareOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| wire_err("exchange.declare", err))
            }
            RpcRequest::ExchangeDelete { exchange, .. } => channel
                .exchange_delete(exchange, ExchangeDeleteOptions::default())
                .await
                .map_err(|err| wire_err("exchange.delete", err)),
        }
    }

    async fn close(&mut self) {
        if let Some(channel) = self.publish_channel.take() {
            let _ = channel.close(200, "closing").await;
        }
        if let Some(channel) = self.rpc_channel.take() {
            let _ = channel.close(200, "closing").await;
        }
        if let Some(connection) = self.connection.take() {
            let _ = connection.close(200, "closing").await;
        }
    }
}

/// Heartbeat-miss detection is delegated to `lapin`'s own reactor, which
/// drops the connection on a missed heartbeat; this just documents the
/// interval samwised should expect a dead connection to surface within.
pub fn heartbeat_grace(heartbeat_s: u16) -> Duration {
    Duration::from_secs(u64::from(heartbeat_s) * 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> BackendConfig {
        BackendConfig {
            name: "primary".to_string(),
            host: "broker.internal".to_string(),
            port: 5672,
            user: "samwise".to_string(),
            pass: "secret".to_string(),
            heartbeat_s: 30,
            tries: -1,
            interval_ms: 5_000,
            queue_capacity: 1024,
        }
    }

    #[test]
    fn uri_carries_host_port_credentials_and_heartbeat() {
        let uri = to_uri(&sample_config());
        assert_eq!(uri.authority.host, "broker.internal");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn exchange_kind_maps_known_names_and_falls_back_to_custom() {
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("x-consistent-hash"), ExchangeKind::Custom(k) if k == "x-consistent-hash"));
    }

    #[test]
    fn heartbeat_grace_is_twice_the_configured_heartbeat() {
        assert_eq!(heartbeat_grace(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn publish_without_a_connection_is_a_core_error() {
        let mut backend = RmqBackend::new(&sample_config());
        let publish = StoredPublish {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
            properties: Default::default(),
            headers: vec![],
            payload: bytes::Bytes::from_static(b"x"),
        };
        let err = backend.publish(1, &publish).await.unwrap_err();
        assert!(matches!(err, CoreError::NoBrokerAvailable));
    }
}
