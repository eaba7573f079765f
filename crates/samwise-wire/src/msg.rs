// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `Msg` — an ordered sequence of opaque frames, with picture-based
//! accessors and a length-prefixed binary encoding.
//!
//! Grounded on the original `sam_msg_t` (`sam_msg.h`/`sam_msg.c`): `pop`
//! consumes leading frames destructively, `contain`/`contained` move frames
//! into a held set so later handlers can look them up without re-parsing,
//! and `dup` produces an independent deep copy of whatever remains.

use std::collections::VecDeque;

use crate::error::WireError;
use crate::frame::{decode_one, Frame, Value};

/// An ordered sequence of frames.
#[derive(Debug, Clone, Default)]
pub struct Msg {
    frames: VecDeque<Frame>,
    held: Vec<Frame>,
}

impl Msg {
    /// Build a message from an ordered list of frames.
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            held: Vec::new(),
        }
    }

    /// The frames not yet popped or contained, in order.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Number of frames not yet popped or contained.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if there are no remaining frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Append a frame to the end of the remaining frames.
    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    /// Consume leading frames according to `picture` (`i`, `s`, `f`, `p`),
    /// returning one [`Value`] per picture character, in order.
    ///
    /// Errors (and leaves the message unmodified) if fewer frames remain
    /// than the picture requires, or a frame fails to parse as its
    /// requested kind.
    pub fn pop(&mut self, picture: &str) -> Result<Vec<Value>, WireError> {
        if self.frames.len() < picture.chars().count() {
            return Err(WireError::MissingFrame(
                picture.chars().nth(self.frames.len()).unwrap_or('?'),
            ));
        }

        let mut values = Vec::with_capacity(picture.len());
        for ch in picture.chars() {
            // Peek-decode before committing any pop, so a mid-picture parse
            // failure leaves `self.frames` untouched.
            let frame = self
                .frames
                .front()
                .ok_or(WireError::MissingFrame(ch))?
                .clone();
            let value = decode_one(ch, &frame)?;
            self.frames.pop_front();
            values.push(value);
        }
        Ok(values)
    }

    /// Move leading frames matching `picture` into the held set, where they
    /// survive across multiple [`Msg::contained`] calls.
    pub fn contain(&mut self, picture: &str) -> Result<(), WireError> {
        let count = picture.chars().count();
        if self.frames.len() < count {
            return Err(WireError::MissingFrame(
                picture.chars().nth(self.frames.len()).unwrap_or('?'),
            ));
        }
        for _ in 0..count {
            if let Some(frame) = self.frames.pop_front() {
                self.held.push(frame);
            }
        }
        Ok(())
    }

    /// Idempotently decode the held frames according to `picture`. Unlike
    /// [`Msg::pop`], repeated calls return the same values — the frames
    /// stay in the held set.
    pub fn contained(&self, picture: &str) -> Result<Vec<Value>, WireError> {
        if self.held.len() < picture.chars().count() {
            return Err(WireError::MissingFrame(
                picture.chars().nth(self.held.len()).unwrap_or('?'),
            ));
        }
        picture
            .chars()
            .zip(self.held.iter())
            .map(|(ch, frame)| decode_one(ch, frame))
            .collect()
    }

    /// Deep-copy the remaining (not held, not popped) frames into a new,
    /// independent message.
    pub fn dup(&self) -> Msg {
        Msg {
            frames: self.frames.iter().cloned().collect(),
            held: Vec::new(),
        }
    }

    /// Size in bytes of the encoding that [`Msg::encode`] would produce for
    /// the remaining frames.
    pub fn encoded_size(&self) -> usize {
        4 + self.frames.iter().map(|f| 4 + f.len()).sum::<usize>()
    }

    /// Encode the remaining frames as `(frame_count: u32 LE, (frame_len: u32
    /// LE, frame_bytes)*)`, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_size());
        buf.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for frame in &self.frames {
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(frame);
        }
    }

    /// Inverse of [`Msg::encode`]. Returns the decoded message and the
    /// number of bytes consumed from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<(Msg, usize), WireError> {
        if bytes.len() < 4 {
            return Err(WireError::Truncated);
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let mut cursor = 4usize;
        let mut frames = VecDeque::with_capacity(count);
        for _ in 0..count {
            if bytes.len() < cursor + 4 {
                return Err(WireError::Truncated);
            }
            let len =
                u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            if bytes.len() < cursor + len {
                return Err(WireError::Truncated);
            }
            frames.push_back(Frame::copy_from_slice(&bytes[cursor..cursor + len]));
            cursor += len;
        }
        Ok((Msg { frames, held: Vec::new() }, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(s: &str) -> Frame {
        Frame::from(s.as_bytes().to_vec())
    }

    #[test]
    fn pop_picture_roundtrip() {
        let mut msg = Msg::new([f("42"), f("hello"), f("\x01\x02\x03")]);
        let values = msg.pop("isf").unwrap();
        assert_eq!(values[0].as_int(), Some(42));
        assert_eq!(values[1].as_str(), Some("hello"));
        assert_eq!(values[2].as_bytes(), &[1, 2, 3]);
        assert!(msg.is_empty());
    }

    #[test]
    fn pop_missing_frame_leaves_message_untouched() {
        let mut msg = Msg::new([f("42")]);
        let err = msg.pop("is");
        assert!(err.is_err());
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn contain_then_contained_is_idempotent() {
        let mut msg = Msg::new([f("7"), f("topic")]);
        msg.contain("is").unwrap();
        let first = msg.contained("is").unwrap();
        let second = msg.contained("is").unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].as_int(), Some(7));
        assert!(msg.is_empty());
    }

    #[test]
    fn dup_is_a_deep_copy() {
        let msg = Msg::new([f("a"), f("b")]);
        let mut copy = msg.dup();
        copy.pop("s").unwrap();
        assert_eq!(msg.len(), 2);
        assert_eq!(copy.len(), 1);
    }

    #[test]
    fn encode_decode_roundtrip_is_byte_for_byte() {
        let msg = Msg::new([f("alpha"), f(""), f("gamma")]);
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), msg.encoded_size());

        let (decoded, consumed) = Msg::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        let original: Vec<_> = msg.frames().cloned().collect();
        let round_tripped: Vec<_> = decoded.frames().cloned().collect();
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn decode_truncated_buffer_errors() {
        let msg = Msg::new([f("alpha")]);
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Msg::decode(&buf).is_err());
    }
}
