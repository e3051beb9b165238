// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::broadcast;

/// The key-value primitives the engine consumes.
///
/// Modelled on a Redis-style keyspace: flat string keys holding strings,
/// sets, hashes, lists or sorted sets, with per-key TTLs.  Negative list
/// indices count from the tail, as in `LRANGE`/`LINDEX`/`LTRIM`.
///
/// Implementations must make every single call atomic.  Cross-call
/// atomicity is the caller's problem (advisory fence keys via
/// [`Store::set_nx_ex`]).
pub trait Store: Send + Sync {
    // ── strings ──────────────────────────────────────────────────────────
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn set_ex(&self, key: &str, value: &str, ttl_secs: u64);
    /// Set only if absent; returns whether the key was set.  The TTL always
    /// applies on success.
    fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> bool;
    fn del(&self, key: &str) -> bool;
    fn exists(&self, key: &str) -> bool;
    fn expire(&self, key: &str, ttl_secs: u64);
    /// Atomically increment an integer key (missing keys start at zero).
    fn incr(&self, key: &str) -> i64;

    // ── sets ─────────────────────────────────────────────────────────────
    fn sadd(&self, key: &str, member: &str) -> bool;
    fn srem(&self, key: &str, member: &str) -> bool;
    fn smembers(&self, key: &str) -> BTreeSet<String>;
    fn sismember(&self, key: &str, member: &str) -> bool;

    // ── hashes ───────────────────────────────────────────────────────────
    fn hget(&self, key: &str, field: &str) -> Option<String>;
    fn hset(&self, key: &str, field: &str, value: &str);
    fn hdel(&self, key: &str, field: &str) -> bool;
    fn hgetall(&self, key: &str) -> BTreeMap<String, String>;

    // ── lists ────────────────────────────────────────────────────────────
    /// Append entries; returns the new length.
    fn rpush(&self, key: &str, values: &[String]) -> usize;
    fn rpop(&self, key: &str) -> Option<String>;
    fn lrange(&self, key: &str, start: i64, stop: i64) -> Vec<String>;
    fn llen(&self, key: &str) -> usize;
    fn lindex(&self, key: &str, index: i64) -> Option<String>;
    fn ltrim(&self, key: &str, start: i64, stop: i64);

    // ── sorted sets ──────────────────────────────────────────────────────
    fn zadd(&self, key: &str, member: &str, score: f64);
    fn zrange(&self, key: &str, start: i64, stop: i64) -> Vec<String>;
    fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Vec<String>;
    fn zrem(&self, key: &str, members: &[String]);
    fn zcard(&self, key: &str) -> usize;
    fn zscore(&self, key: &str, member: &str) -> Option<f64>;

    // ── scans ────────────────────────────────────────────────────────────
    /// All live keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    // ── capped event stream ──────────────────────────────────────────────
    /// Append to a capped stream, trimming the oldest entries past `maxlen`.
    fn stream_append(&self, key: &str, entry: &str, maxlen: usize);
    fn stream_len(&self, key: &str) -> usize;

    // ── pub/sub ──────────────────────────────────────────────────────────
    /// Fire-and-forget notification; subscribers that lag simply miss
    /// messages.
    fn publish(&self, channel: &str, message: &str);
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}
