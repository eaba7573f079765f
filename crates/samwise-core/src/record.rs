// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The buffer record (BR) shapes PKV stores under a message's numeric key,
//! and their binary encoding.
//!
//! Three shapes, per spec §3:
//!
//! - `Live`: an outstanding publish, still needing `acks_remaining` more
//!   backend acks. Carries the [`crate::stored::StoredPublish`] needed to
//!   resend it and, for `Redundant` policies, a bitset of which configured
//!   backends have already acked (so a duplicate ack from a reconnecting
//!   backend is a no-op instead of double-counting).
//! - `AckOnly`: written when an ack arrives for a key under which nothing
//!   has been `save`d yet (the ack raced ahead of the publish, or the
//!   message was already acked out and this is a stale duplicate). Holds
//!   just the running ack count and bitset so a later `save`, or a further
//!   ack walking the same key, has something to reconcile against without
//!   ever having stored a payload.
//! - `Tombstone`: left behind at an old key when a message is resent under
//!   a new key, so an ack bearing the old key can still be walked forward
//!   to the live record (spec §4.3.2) and so the retry scan can walk
//!   backward from a freshly inserted key to the one it replaced.
//!
//! Encoding is a one-byte tag followed by fixed-width little-endian fields,
//! with `Live`'s [`crate::stored::StoredPublish`] trailer appended as an
//! encoded [`samwise_wire::Msg`].

use samwise_wire::Msg;

use crate::error::CoreError;
use crate::stored::StoredPublish;

const TAG_LIVE: u8 = 0;
const TAG_ACK_ONLY: u8 = 1;
const TAG_TOMBSTONE: u8 = 2;

/// A PKV-resident record for one buffered message.
#[derive(Debug, Clone)]
pub enum BufferRecord {
    Live {
        /// Backend acks still required before this message is done.
        acks_remaining: u32,
        /// Bitset, one bit per configured backend index, tracking which
        /// backends have already acked this key (suppresses duplicate
        /// acks from a backend that reconnects and replays confirms).
        acked_backends: u64,
        /// Monotonic milliseconds since epoch this record was last
        /// (re)written; drives the retry pass's silence timeout.
        last_sent_ms: i64,
        /// Number of times this message has been sent, including the
        /// original send. Bounded by `buffer.max_retries`.
        tries: u32,
        /// The key this record replaced via resend, or `-1` for an
        /// original publish. Lets the retry scan walk a tombstone chain
        /// back to account for in-flight acks under the old key.
        prev_key: i32,
        /// The durable publish payload and options, needed to resend.
        publish: StoredPublish,
    },
    AckOnly {
        acks_remaining: u32,
        acked_backends: u64,
    },
    Tombstone {
        /// Key this tombstone redirects an ack from.
        prev_key: i32,
        /// Key the message now lives at (or another tombstone).
        next_key: i32,
    },
}

impl BufferRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            BufferRecord::Live {
                acks_remaining,
                acked_backends,
                last_sent_ms,
                tries,
                prev_key,
                publish,
            } => {
                out.push(TAG_LIVE);
                out.extend_from_slice(&acks_remaining.to_le_bytes());
                out.extend_from_slice(&acked_backends.to_le_bytes());
                out.extend_from_slice(&last_sent_ms.to_le_bytes());
                out.extend_from_slice(&tries.to_le_bytes());
                out.extend_from_slice(&prev_key.to_le_bytes());
                publish.to_msg().encode(&mut out);
            }
            BufferRecord::AckOnly {
                acks_remaining,
                acked_backends,
            } => {
                out.push(TAG_ACK_ONLY);
                out.extend_from_slice(&acks_remaining.to_le_bytes());
                out.extend_from_slice(&acked_backends.to_le_bytes());
            }
            BufferRecord::Tombstone { prev_key, next_key } => {
                out.push(TAG_TOMBSTONE);
                out.extend_from_slice(&prev_key.to_le_bytes());
                out.extend_from_slice(&next_key.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let corrupt = |msg: &str| CoreError::CorruptRecord(msg.to_string());
        let (&tag, rest) = bytes.split_first().ok_or_else(|| corrupt("empty record"))?;
        match tag {
            TAG_LIVE => {
                let acks_remaining = take_u32(rest, 0).ok_or_else(|| corrupt("live: acks_remaining"))?;
                let acked_backends = take_u64(rest, 4).ok_or_else(|| corrupt("live: acked_backends"))?;
                let last_sent_ms = take_i64(rest, 12).ok_or_else(|| corrupt("live: last_sent_ms"))?;
                let tries = take_u32(rest, 20).ok_or_else(|| corrupt("live: tries"))?;
                let prev_key = take_i32(rest, 24).ok_or_else(|| corrupt("live: prev_key"))?;
                let trailer = rest.get(28..).ok_or_else(|| corrupt("live: missing trailer"))?;
                let (msg, _) = Msg::decode(trailer).map_err(|e| corrupt(&e.to_string()))?;
                let publish = StoredPublish::from_msg(msg).map_err(|e| corrupt(&e.to_string()))?;
                Ok(BufferRecord::Live {
                    acks_remaining,
                    acked_backends,
                    last_sent_ms,
                    tries,
                    prev_key,
                    publish,
                })
            }
            TAG_ACK_ONLY => {
                let acks_remaining = take_u32(rest, 0).ok_or_else(|| corrupt("ack_only: acks_remaining"))?;
                let acked_backends = take_u64(rest, 4).ok_or_else(|| corrupt("ack_only: acked_backends"))?;
                Ok(BufferRecord::AckOnly {
                    acks_remaining,
                    acked_backends,
                })
            }
            TAG_TOMBSTONE => {
                let prev_key = take_i32(rest, 0).ok_or_else(|| corrupt("tombstone: prev_key"))?;
                let next_key = take_i32(rest, 4).ok_or_else(|| corrupt("tombstone: next_key"))?;
                Ok(BufferRecord::Tombstone { prev_key, next_key })
            }
            other => Err(corrupt(&format!("unknown tag {other}"))),
        }
    }

}

fn take_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
}

fn take_i32(buf: &[u8], at: usize) -> Option<i32> {
    buf.get(at..at + 4)
        .map(|s| i32::from_le_bytes(s.try_into().unwrap()))
}

fn take_u64(buf: &[u8], at: usize) -> Option<u64> {
    buf.get(at..at + 8)
        .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
}

fn take_i64(buf: &[u8], at: usize) -> Option<i64> {
    buf.get(at..at + 8)
        .map(|s| i64::from_le_bytes(s.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use samwise_wire::protocol::PublishProperties;

    fn sample_publish() -> StoredPublish {
        StoredPublish {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
            properties: PublishProperties::default(),
            headers: vec![],
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn live_record_roundtrips() {
        let rec = BufferRecord::Live {
            acks_remaining: 2,
            acked_backends: 0b101,
            last_sent_ms: 1_700_000_000_123,
            tries: 1,
            prev_key: -1,
            publish: sample_publish(),
        };
        let bytes = rec.encode();
        let decoded = BufferRecord::decode(&bytes).unwrap();
        match decoded {
            BufferRecord::Live {
                acks_remaining,
                acked_backends,
                last_sent_ms,
                tries,
                prev_key,
                publish,
            } => {
                assert_eq!(acks_remaining, 2);
                assert_eq!(acked_backends, 0b101);
                assert_eq!(last_sent_ms, 1_700_000_000_123);
                assert_eq!(tries, 1);
                assert_eq!(prev_key, -1);
                assert_eq!(publish, sample_publish());
            }
            _ => panic!("expected live"),
        }
    }

    #[test]
    fn ack_only_record_roundtrips() {
        let rec = BufferRecord::AckOnly {
            acks_remaining: 1,
            acked_backends: 0b1,
        };
        let decoded = BufferRecord::decode(&rec.encode()).unwrap();
        assert!(matches!(
            decoded,
            BufferRecord::AckOnly {
                acks_remaining: 1,
                acked_backends: 0b1
            }
        ));
    }

    #[test]
    fn tombstone_record_roundtrips() {
        let rec = BufferRecord::Tombstone {
            prev_key: 10,
            next_key: 20,
        };
        let decoded = BufferRecord::decode(&rec.encode()).unwrap();
        assert!(matches!(
            decoded,
            BufferRecord::Tombstone {
                prev_key: 10,
                next_key: 20
            }
        ));
    }

    #[test]
    fn decode_unknown_tag_is_corrupt() {
        let err = BufferRecord::decode(&[9, 0, 0]).unwrap_err();
        assert!(matches!(err, CoreError::CorruptRecord(_)));
    }
}
