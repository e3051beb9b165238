// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed interaction states and their wire codec.
//!
//! A state is one frame on an interaction stack.  States are frozen once
//! pushed; "mutation" is always expressed as a new push.  The codec turns a
//! state into a small versioned envelope suitable for list storage, with
//! transparent gzip compression of oversized payloads.
mod codec;
mod state;

pub use codec::{decode, encode, encode_with_threshold, CodecError, Envelope, DEFAULT_GZIP_THRESHOLD};
pub use state::{State, WaitKind};
