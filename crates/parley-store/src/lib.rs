// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared key-value store abstraction.
//!
//! The engine keeps all of its coordination state — branches, membership
//! sets, tick counters, TTL'd guard keys, artifact indices — behind the
//! [`Store`] trait.  [`MemoryStore`] is the default engine: a single
//! mutex-guarded keyspace, so every trait call is atomic.  Multi-key
//! critical sections are protected with short-TTL advisory fence keys
//! (`set_nx_ex`) rather than transactions.
mod clock;
mod kv;
mod memory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use kv::Store;
pub use memory::MemoryStore;
