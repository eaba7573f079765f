// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Samwise client wire protocol: a frame list `(protocol_version,
//! action, ...)` decoded once, at the socket boundary, into typed request
//! structs — per the design note in spec §9 retiring dynamic picture
//! parsing from the application layer. [`crate::Msg`] still does the
//! underlying frame-list accounting.

use bytes::Bytes;

use crate::error::WireError;
use crate::frame::Frame;
use crate::msg::Msg;
use crate::PROTOCOL_VERSION;

/// Per-message distribution policy, fixed for the message's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionPolicy {
    /// Exactly one connected backend, chosen round-robin.
    RoundRobin,
    /// The first `n` connected backends, in configuration order.
    Redundant(u32),
}

impl DistributionPolicy {
    /// Number of distinct backend acks required before a message is
    /// considered delivered.
    pub fn n_required(self) -> u32 {
        match self {
            DistributionPolicy::RoundRobin => 1,
            DistributionPolicy::Redundant(n) => n,
        }
    }
}

/// The 12 AMQP-style properties attached to a publish, each optional. An
/// empty wire frame is normalised to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<String>,
    pub priority: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

const PROPERTY_COUNT: usize = 12;

impl PublishProperties {
    fn from_frames(frames: &[String; PROPERTY_COUNT]) -> Self {
        fn norm(s: &str) -> Option<String> {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        }
        Self {
            content_type: norm(&frames[0]),
            content_encoding: norm(&frames[1]),
            delivery_mode: norm(&frames[2]),
            priority: norm(&frames[3]),
            correlation_id: norm(&frames[4]),
            reply_to: norm(&frames[5]),
            expiration: norm(&frames[6]),
            message_id: norm(&frames[7]),
            kind: norm(&frames[8]),
            user_id: norm(&frames[9]),
            app_id: norm(&frames[10]),
            cluster_id: norm(&frames[11]),
        }
    }
}

/// A validated `publish` request, ready for `Buffer::save` and backend
/// fan-out.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub distribution: DistributionPolicy,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: PublishProperties,
    pub headers: Vec<(String, String)>,
    pub payload: Frame,
}

/// An RPC fan-out request (exchange management).
#[derive(Debug, Clone)]
pub enum RpcRequest {
    ExchangeDeclare {
        broker_name: Option<String>,
        exchange: String,
        kind: String,
    },
    ExchangeDelete {
        broker_name: Option<String>,
        exchange: String,
    },
}

/// A decoded client request, after protocol-version validation.
#[derive(Debug, Clone)]
pub enum Request {
    Publish(PublishRequest),
    Rpc(RpcRequest),
    Ping,
}

/// The response to every client request: `(rc, message)`. `rc == 0` is
/// success; `rc < 0` is an error described by `message`.
#[derive(Debug, Clone)]
pub struct Response {
    pub rc: i32,
    pub message: String,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            rc: 0,
            message: message.into(),
        }
    }

    pub fn ok_key(key: i32) -> Self {
        Self {
            rc: 0,
            message: key.to_string(),
        }
    }

    pub fn error(rc: i32, message: impl Into<String>) -> Self {
        debug_assert!(rc < 0, "error responses must carry a negative rc");
        Self {
            rc,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Msg {
        Msg::new([
            Frame::from(self.rc.to_string().into_bytes()),
            Frame::from(self.message.clone().into_bytes()),
        ])
    }
}

fn bool_frame(value: &str) -> Result<bool, WireError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(WireError::Malformed(format!(
            "expected '0' or '1', got {other:?}"
        ))),
    }
}

fn decimal(value: &str) -> Result<i64, WireError> {
    value
        .trim()
        .parse()
        .map_err(|_| WireError::Malformed(format!("expected decimal integer, got {value:?}")))
}

/// Parse a full client request off the wire: version check, then the
/// action grammar in spec §6.
pub fn decode_request(mut msg: Msg) -> Result<Request, WireError> {
    let header = msg.pop("is")?;
    let version = header[0]
        .as_int()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| WireError::Malformed("bad protocol_version frame".into()))?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let action = header[1].as_str().unwrap_or_default().to_string();

    match action.as_str() {
        "publish" => decode_publish(msg).map(Request::Publish),
        "rpc exchange.declare" => {
            let values = msg.pop("sss")?;
            let broker_name = non_empty(values[0].as_str().unwrap_or_default());
            let exchange = values[1].as_str().unwrap_or_default().to_string();
            let kind = values[2].as_str().unwrap_or_default().to_string();
            Ok(Request::Rpc(RpcRequest::ExchangeDeclare {
                broker_name,
                exchange,
                kind,
            }))
        }
        "rpc exchange.delete" => {
            let values = msg.pop("ss")?;
            let broker_name = non_empty(values[0].as_str().unwrap_or_default());
            let exchange = values[1].as_str().unwrap_or_default().to_string();
            Ok(Request::Rpc(RpcRequest::ExchangeDelete {
                broker_name,
                exchange,
            }))
        }
        "ping" => Ok(Request::Ping),
        other => Err(WireError::Malformed(format!("unknown action {other:?}"))),
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn decode_publish(mut msg: Msg) -> Result<PublishRequest, WireError> {
    let distribution_tag = msg.pop("s")?[0].as_str().unwrap_or_default().to_string();
    let distribution = match distribution_tag.as_str() {
        "round robin" => DistributionPolicy::RoundRobin,
        "redundant" => {
            let n = decimal(msg.pop("s")?[0].as_str().unwrap_or_default())?;
            let n = u32::try_from(n)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| WireError::Malformed("redundant n must be >= 1".into()))?;
            DistributionPolicy::Redundant(n)
        }
        other => {
            return Err(WireError::Malformed(format!(
                "unknown distribution policy {other:?}"
            )))
        }
    };

    let exchange = msg_pop_str(&mut msg)?;
    let routing_key = msg_pop_str(&mut msg)?;
    let mandatory = bool_frame(&msg_pop_str(&mut msg)?)?;
    let immediate = bool_frame(&msg_pop_str(&mut msg)?)?;

    let prop_count = decimal(&msg_pop_str(&mut msg)?)?;
    if prop_count != PROPERTY_COUNT as i64 {
        return Err(WireError::Malformed(format!(
            "prop_count must be {PROPERTY_COUNT}, got {prop_count}"
        )));
    }
    let mut prop_frames: [String; PROPERTY_COUNT] = Default::default();
    for slot in prop_frames.iter_mut() {
        *slot = msg_pop_str(&mut msg)?;
    }
    let properties = PublishProperties::from_frames(&prop_frames);

    let header_count = decimal(&msg_pop_str(&mut msg)?)?;
    if header_count < 0 {
        return Err(WireError::Malformed("header_count must be >= 0".into()));
    }
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let key = msg_pop_str(&mut msg)?;
        let value = msg_pop_str(&mut msg)?;
        headers.push((key, value));
    }

    let payload = msg.pop("f")?[0].as_bytes().to_vec();

    Ok(PublishRequest {
        distribution,
        exchange,
        routing_key,
        mandatory,
        immediate,
        properties,
        headers,
        payload: Bytes::from(payload),
    })
}

fn msg_pop_str(msg: &mut Msg) -> Result<String, WireError> {
    Ok(msg.pop("s")?[0].as_str().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Frame {
        Frame::from(v.as_bytes().to_vec())
    }

    fn ping_msg() -> Msg {
        Msg::new([s("1"), s("ping")])
    }

    #[test]
    fn ping_decodes() {
        let req = decode_request(ping_msg()).unwrap();
        assert!(matches!(req, Request::Ping));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let msg = Msg::new([s("99"), s("ping")]);
        let err = decode_request(msg).unwrap_err();
        assert!(matches!(err, WireError::UnsupportedVersion(99)));
    }

    #[test]
    fn publish_round_robin_decodes() {
        let mut frames = vec![s("1"), s("publish"), s("round robin")];
        frames.push(s("my-exchange"));
        frames.push(s("rk"));
        frames.push(s("0"));
        frames.push(s("0"));
        frames.push(s("12"));
        for _ in 0..12 {
            frames.push(s(""));
        }
        frames.push(s("0"));
        frames.push(s("payload-bytes"));

        let req = decode_request(Msg::new(frames)).unwrap();
        match req {
            Request::Publish(p) => {
                assert_eq!(p.distribution, DistributionPolicy::RoundRobin);
                assert_eq!(p.exchange, "my-exchange");
                assert!(!p.mandatory);
                assert_eq!(p.payload.as_ref(), b"payload-bytes");
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn publish_redundant_requires_n() {
        let mut frames = vec![s("1"), s("publish"), s("redundant"), s("3")];
        frames.push(s("x"));
        frames.push(s("rk"));
        frames.push(s("1"));
        frames.push(s("0"));
        frames.push(s("12"));
        for _ in 0..12 {
            frames.push(s(""));
        }
        frames.push(s("1"));
        frames.push(s("h-key"));
        frames.push(s("h-val"));
        frames.push(s("body"));

        let req = decode_request(Msg::new(frames)).unwrap();
        match req {
            Request::Publish(p) => {
                assert_eq!(p.distribution, DistributionPolicy::Redundant(3));
                assert!(p.mandatory);
                assert_eq!(p.headers, vec![("h-key".to_string(), "h-val".to_string())]);
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn rpc_exchange_declare_decodes() {
        let msg = Msg::new([
            s("1"),
            s("rpc exchange.declare"),
            s(""),
            s("ex"),
            s("fanout"),
        ]);
        let req = decode_request(msg).unwrap();
        match req {
            Request::Rpc(RpcRequest::ExchangeDeclare {
                broker_name,
                exchange,
                kind,
            }) => {
                assert_eq!(broker_name, None);
                assert_eq!(exchange, "ex");
                assert_eq!(kind, "fanout");
            }
            _ => panic!("expected exchange.declare"),
        }
    }

    #[test]
    fn response_encodes_rc_and_message() {
        let resp = Response::ok_key(7);
        let msg = resp.encode();
        let values: Vec<_> = msg.frames().cloned().collect();
        assert_eq!(values[0], Frame::from(b"0".to_vec()));
        assert_eq!(values[1], Frame::from(b"7".to_vec()));
    }
}
