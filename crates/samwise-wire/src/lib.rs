// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame-list wire message helper (`Msg`) and the Samwise client protocol.
//!
//! `Msg` carries an ordered sequence of opaque frames between components and
//! knows how to persist itself as a flat, length-prefixed byte buffer. The
//! client-facing request/response types in [`protocol`] are decoded once at
//! the socket boundary from the same frame-list primitive.

mod error;
mod frame;
mod msg;

pub mod codec;
pub mod protocol;

pub use error::WireError;
pub use frame::{Frame, Value};
pub use msg::Msg;

/// Protocol version negotiated at the start of every client connection.
pub const PROTOCOL_VERSION: u16 = 1;
