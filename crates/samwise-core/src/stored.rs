// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `StoredPublish` — the wire-opts-plus-payload form of a publish request
//! that BUF persists inside a `Live` [`crate::record::BufferRecord`] so a
//! resend can rebuild the original publish without consulting the client.
//!
//! This is the "encoded M appended" trailer spec §3 describes. It reuses
//! `samwise-wire`'s frame-list primitive for the encoding but carries
//! exactly the fields DISP/BBW need to republish — the distribution policy
//! itself is not part of it, since BUF already tracks policy satisfaction
//! via `acks_remaining`/`be_acks`.

use bytes::Bytes;
use samwise_wire::protocol::{PublishProperties, PublishRequest};
use samwise_wire::{Frame, Msg, WireError};

/// The durable, policy-stripped form of a publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: PublishProperties,
    pub headers: Vec<(String, String)>,
    pub payload: Frame,
}

impl From<&PublishRequest> for StoredPublish {
    fn from(req: &PublishRequest) -> Self {
        Self {
            exchange: req.exchange.clone(),
            routing_key: req.routing_key.clone(),
            mandatory: req.mandatory,
            immediate: req.immediate,
            properties: req.properties.clone(),
            headers: req.headers.clone(),
            payload: req.payload.clone(),
        }
    }
}

fn bool_frame(b: bool) -> Frame {
    Frame::from(if b { &b"1"[..] } else { &b"0"[..] })
}

fn str_frame(s: &str) -> Frame {
    Frame::from(s.as_bytes().to_vec())
}

fn opt_frame(s: &Option<String>) -> Frame {
    str_frame(s.as_deref().unwrap_or(""))
}

impl StoredPublish {
    /// Encode as a frame list, matching the order of the 12 named
    /// properties and header pairs used on the client wire.
    pub fn to_msg(&self) -> Msg {
        let p = &self.properties;
        let mut frames = vec![
            str_frame(&self.exchange),
            str_frame(&self.routing_key),
            bool_frame(self.mandatory),
            bool_frame(self.immediate),
            str_frame("12"),
            opt_frame(&p.content_type),
            opt_frame(&p.content_encoding),
            opt_frame(&p.delivery_mode),
            opt_frame(&p.priority),
            opt_frame(&p.correlation_id),
            opt_frame(&p.reply_to),
            opt_frame(&p.expiration),
            opt_frame(&p.message_id),
            opt_frame(&p.kind),
            opt_frame(&p.user_id),
            opt_frame(&p.app_id),
            opt_frame(&p.cluster_id),
            str_frame(&self.headers.len().to_string()),
        ];
        for (k, v) in &self.headers {
            frames.push(str_frame(k));
            frames.push(str_frame(v));
        }
        frames.push(self.payload.clone());
        Msg::new(frames)
    }

    /// Decode the form produced by [`StoredPublish::to_msg`].
    pub fn from_msg(mut msg: Msg) -> Result<Self, WireError> {
        let exchange = pop_str(&mut msg)?;
        let routing_key = pop_str(&mut msg)?;
        let mandatory = pop_str(&mut msg)? == "1";
        let immediate = pop_str(&mut msg)? == "1";

        let prop_count: usize = pop_str(&mut msg)?
            .parse()
            .map_err(|_| WireError::Malformed("bad prop_count".into()))?;
        if prop_count != 12 {
            return Err(WireError::Malformed(format!(
                "expected 12 properties, got {prop_count}"
            )));
        }
        let mut props = [(); 12].map(|_| String::new());
        for slot in props.iter_mut() {
            *slot = pop_str(&mut msg)?;
        }
        fn norm(s: String) -> Option<String> {
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        let properties = PublishProperties {
            content_type: norm(props[0].clone()),
            content_encoding: norm(props[1].clone()),
            delivery_mode: norm(props[2].clone()),
            priority: norm(props[3].clone()),
            correlation_id: norm(props[4].clone()),
            reply_to: norm(props[5].clone()),
            expiration: norm(props[6].clone()),
            message_id: norm(props[7].clone()),
            kind: norm(props[8].clone()),
            user_id: norm(props[9].clone()),
            app_id: norm(props[10].clone()),
            cluster_id: norm(props[11].clone()),
        };

        let header_count: usize = pop_str(&mut msg)?
            .parse()
            .map_err(|_| WireError::Malformed("bad header_count".into()))?;
        let mut headers = Vec::with_capacity(header_count);
        for _ in 0..header_count {
            let key = pop_str(&mut msg)?;
            let value = pop_str(&mut msg)?;
            headers.push((key, value));
        }

        let payload = msg.pop("f")?[0].as_bytes().to_vec();

        Ok(Self {
            exchange,
            routing_key,
            mandatory,
            immediate,
            properties,
            headers,
            payload: Bytes::from(payload),
        })
    }
}

fn pop_str(msg: &mut Msg) -> Result<String, WireError> {
    Ok(msg.pop("s")?[0].as_str().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_publish_roundtrips_through_msg() {
        let stored = StoredPublish {
            exchange: "orders".into(),
            routing_key: "orders.created".into(),
            mandatory: true,
            immediate: false,
            properties: PublishProperties {
                content_type: Some("application/json".into()),
                ..Default::default()
            },
            headers: vec![("x-trace".into(), "abc123".into())],
            payload: Bytes::from_static(b"{}"),
        };

        let msg = stored.to_msg();
        let decoded = StoredPublish::from_msg(msg).unwrap();
        assert_eq!(stored, decoded);
    }
}
