// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Async framing for [`Msg`] over any `tokio` byte stream.
//!
//! `Msg::encode`/`Msg::decode` already describe a self-delimiting layout
//! (frame count, then each frame's own length prefix), so the socket codec
//! doesn't need an outer envelope — it just reads that same shape a field at
//! a time instead of requiring the whole message buffered up front.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::frame::Frame;
use crate::msg::Msg;

/// Frames per message beyond this are rejected as a malformed/hostile peer
/// rather than an honest oversized request.
pub const MAX_FRAME_COUNT: u32 = 4_096;

/// Bytes per frame beyond this are rejected the same way.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

fn io_err(err: std::io::Error) -> WireError {
    WireError::Io(err.to_string())
}

/// Read one [`Msg`] from `reader`. Returns `Ok(None)` on a clean EOF at a
/// message boundary (the peer closed the connection), distinguishing a
/// graceful close from a truncated message mid-read.
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Msg>, WireError> {
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(io_err(err)),
    }
    let count = u32::from_le_bytes(count_buf);
    if count > MAX_FRAME_COUNT {
        return Err(WireError::TooLarge(format!("{count} frames")));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(io_err)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(WireError::TooLarge(format!("{len}-byte frame")));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await.map_err(io_err)?;
        frames.push(Frame::from(body));
    }
    Ok(Some(Msg::new(frames)))
}

/// Write one [`Msg`] to `writer` and flush it.
pub async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Msg) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(msg.encoded_size());
    msg.encode(&mut buf);
    writer.write_all(&buf).await.map_err(io_err)?;
    writer.flush().await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame as F;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let msg = Msg::new([F::from_static(b"alpha"), F::from_static(b""), F::from_static(b"gamma")]);
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_msg(&mut cursor).await.unwrap().expect("some message");
        let original: Vec<_> = msg.frames().cloned().collect();
        let round_tripped: Vec<_> = decoded.frames().cloned().collect();
        assert_eq!(original, round_tripped);
    }

    #[tokio::test]
    async fn clean_eof_at_a_boundary_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_msg(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error_not_a_clean_close() {
        let msg = Msg::new([F::from_static(b"alpha")]);
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_msg(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_count_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_COUNT + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(read_msg(&mut cursor).await, Err(WireError::TooLarge(_))));
    }
}
