// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A single opaque frame and the picture-decoded value popped from one.

use crate::error::WireError;
use bytes::Bytes;

/// One opaque frame of a [`crate::Msg`]. WMSG never interprets the content
/// of a frame beyond what a picture accessor asks for.
pub type Frame = Bytes;

/// A value decoded from a frame according to one picture character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Picture `i`: a frame holding a decimal integer.
    Int(i64),
    /// Picture `s`: a frame holding a UTF-8 string.
    Str(String),
    /// Picture `f`: a frame's raw bytes, uninterpreted.
    Frame(Frame),
    /// Picture `p`: an opaque handle frame, uninterpreted.
    Handle(Frame),
}

impl Value {
    /// View this value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// View this value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// View this value as a frame's raw bytes, regardless of picture kind.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Int(_) | Value::Str(_) => &[],
            Value::Frame(f) | Value::Handle(f) => f,
        }
    }
}

/// Decode one frame into a [`Value`] according to a single picture
/// character (`i`, `s`, `f`, `p`).
pub(crate) fn decode_one(picture: char, frame: &Frame) -> Result<Value, WireError> {
    match picture {
        'i' => {
            let text = std::str::from_utf8(frame)?;
            let n: i64 = text
                .trim()
                .parse()
                .map_err(|_| WireError::NotAnInteger(frame.to_vec()))?;
            Ok(Value::Int(n))
        }
        's' => {
            let text = std::str::from_utf8(frame)?;
            Ok(Value::Str(text.to_string()))
        }
        'f' => Ok(Value::Frame(frame.clone())),
        'p' => Ok(Value::Handle(frame.clone())),
        other => Err(WireError::UnknownPicture(other)),
    }
}

/// Encode a value back into a frame (used when building requests/BR
/// payloads in-process, mirroring the picture that produced it).
pub fn encode_one(value: &Value) -> Frame {
    match value {
        Value::Int(n) => Bytes::from(n.to_string().into_bytes()),
        Value::Str(s) => Bytes::from(s.clone().into_bytes()),
        Value::Frame(f) | Value::Handle(f) => f.clone(),
    }
}
