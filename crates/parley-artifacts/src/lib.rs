// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable artifact storage with a fast pointer index.
//!
//! Every state push, tool metric and evaluation lands here as an
//! *artifact*: a header in the store-backed index plus a payload in a
//! [`StorageDriver`].  Timelines, episode groups and score rankings are
//! sorted sets keyed by session, so reads never touch payload storage
//! unless the caller asks for bodies.
mod bus;
mod driver;
mod error;
mod header;

pub use bus::{ArtifactBus, EvalScheduler};
pub use driver::{FsDriver, MemoryDriver, StorageDriver};
pub use error::ArtifactError;
pub use header::{generate_ref, ArtifactHeader};
