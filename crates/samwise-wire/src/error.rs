// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type for frame-list parsing and wire encoding.

use thiserror::Error;

/// Errors raised while popping, encoding, or decoding frame lists.
#[derive(Debug, Error)]
pub enum WireError {
    /// A picture accessor asked for more frames than were available.
    #[error("expected a frame for picture element '{0}', found none")]
    MissingFrame(char),

    /// A picture character isn't one of `i`, `s`, `f`, `p`.
    #[error("unknown picture element '{0}'")]
    UnknownPicture(char),

    /// An `i` picture frame wasn't a valid decimal integer.
    #[error("frame is not a decimal integer: {0:?}")]
    NotAnInteger(Vec<u8>),

    /// An `s` picture frame wasn't valid UTF-8.
    #[error("frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// The encoded byte buffer was truncated or otherwise malformed.
    #[error("truncated or malformed wire encoding")]
    Truncated,

    /// The client's declared protocol version doesn't match ours.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    /// A client request didn't match the grammar for its action.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The frame count or a frame length in an inbound message exceeded the
    /// codec's sanity limit.
    #[error("message exceeds size limit: {0}")]
    TooLarge(String),

    /// The underlying socket read or write failed.
    #[error("wire I/O error: {0}")]
    Io(String),
}
