// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::{Clock, Store, SystemClock};

/// In-process store engine.
///
/// One mutex guards the whole keyspace, which makes every [`Store`] call
/// atomic and keeps multi-value operations (`rpush` of several entries,
/// `ltrim`) indivisible.  Expiry is lazy: a key past its TTL is dropped the
/// next time it is touched.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

struct Entry {
    value: ValueKind,
    /// Epoch seconds; `None` means the key never expires.
    expires_at: Option<f64>,
}

enum ValueKind {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
    List(Vec<String>),
    Zset(BTreeMap<String, f64>),
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry) -> bool {
        matches!(entry.expires_at, Some(at) if at <= self.clock.now())
    }

    /// Fetch a live entry, dropping it first if the TTL lapsed.
    fn live<'a>(
        &self,
        map: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        if map.get(key).is_some_and(|e| self.expired(e)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    /// Fetch-or-create an entry of the wanted shape.  A live entry of a
    /// different shape is replaced, mirroring a type error being fatal in
    /// the backing store.
    fn entry_of<'a>(
        &self,
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        make: fn() -> ValueKind,
        matches_kind: fn(&ValueKind) -> bool,
    ) -> &'a mut Entry {
        let replace = match self.live(map, key) {
            Some(e) => !matches_kind(&e.value),
            None => true,
        };
        if replace {
            map.insert(
                key.to_string(),
                Entry {
                    value: make(),
                    expires_at: None,
                },
            );
        }
        map.get_mut(key).expect("entry just ensured")
    }

    fn drop_if_empty(map: &mut HashMap<String, Entry>, key: &str) {
        let empty = match map.get(key).map(|e| &e.value) {
            Some(ValueKind::Set(s)) => s.is_empty(),
            Some(ValueKind::Hash(h)) => h.is_empty(),
            Some(ValueKind::List(l)) => l.is_empty(),
            Some(ValueKind::Zset(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            map.remove(key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Clamp a Redis-style inclusive `(start, stop)` pair against `len`,
/// returning `None` when the window is empty.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { len + index } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: ValueKind::Str(value.to_string()),
                expires_at: None,
            },
        );
    }

    fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: ValueKind::Str(value.to_string()),
                expires_at: Some(self.clock.now() + ttl_secs as f64),
            },
        );
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let mut map = self.inner.lock().unwrap();
        if self.live(&mut map, key).is_some() {
            return false;
        }
        map.insert(
            key.to_string(),
            Entry {
                value: ValueKind::Str(value.to_string()),
                expires_at: Some(self.clock.now() + ttl_secs as f64),
            },
        );
        true
    }

    fn del(&self, key: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        let live = self.live(&mut map, key).is_some();
        map.remove(key);
        live
    }

    fn exists(&self, key: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        self.live(&mut map, key).is_some()
    }

    fn expire(&self, key: &str, ttl_secs: u64) {
        let mut map = self.inner.lock().unwrap();
        let now = self.clock.now();
        if let Some(entry) = self.live(&mut map, key) {
            entry.expires_at = Some(now + ttl_secs as f64);
        }
    }

    fn incr(&self, key: &str) -> i64 {
        let mut map = self.inner.lock().unwrap();
        let entry = self.entry_of(
            &mut map,
            key,
            || ValueKind::Str("0".to_string()),
            |v| matches!(v, ValueKind::Str(_)),
        );
        let ValueKind::Str(raw) = &mut entry.value else {
            unreachable!()
        };
        let next = raw.parse::<i64>().unwrap_or(0) + 1;
        *raw = next.to_string();
        next
    }

    fn sadd(&self, key: &str, member: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        let entry = self.entry_of(
            &mut map,
            key,
            || ValueKind::Set(BTreeSet::new()),
            |v| matches!(v, ValueKind::Set(_)),
        );
        let ValueKind::Set(set) = &mut entry.value else {
            unreachable!()
        };
        set.insert(member.to_string())
    }

    fn srem(&self, key: &str, member: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        let removed = match self.live(&mut map, key).map(|e| &mut e.value) {
            Some(ValueKind::Set(set)) => set.remove(member),
            _ => false,
        };
        Self::drop_if_empty(&mut map, key);
        removed
    }

    fn smembers(&self, key: &str) -> BTreeSet<String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Set(set)) => set.clone(),
            _ => BTreeSet::new(),
        }
    }

    fn sismember(&self, key: &str, member: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Set(set)) => set.contains(member),
            _ => false,
        }
    }

    fn hget(&self, key: &str, field: &str) -> Option<String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Hash(hash)) => hash.get(field).cloned(),
            _ => None,
        }
    }

    fn hset(&self, key: &str, field: &str, value: &str) {
        let mut map = self.inner.lock().unwrap();
        let entry = self.entry_of(
            &mut map,
            key,
            || ValueKind::Hash(BTreeMap::new()),
            |v| matches!(v, ValueKind::Hash(_)),
        );
        let ValueKind::Hash(hash) = &mut entry.value else {
            unreachable!()
        };
        hash.insert(field.to_string(), value.to_string());
    }

    fn hdel(&self, key: &str, field: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        let removed = match self.live(&mut map, key).map(|e| &mut e.value) {
            Some(ValueKind::Hash(hash)) => hash.remove(field).is_some(),
            _ => false,
        };
        Self::drop_if_empty(&mut map, key);
        removed
    }

    fn hgetall(&self, key: &str) -> BTreeMap<String, String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Hash(hash)) => hash.clone(),
            _ => BTreeMap::new(),
        }
    }

    fn rpush(&self, key: &str, values: &[String]) -> usize {
        let mut map = self.inner.lock().unwrap();
        let entry = self.entry_of(
            &mut map,
            key,
            || ValueKind::List(Vec::new()),
            |v| matches!(v, ValueKind::List(_)),
        );
        let ValueKind::List(list) = &mut entry.value else {
            unreachable!()
        };
        list.extend(values.iter().cloned());
        list.len()
    }

    fn rpop(&self, key: &str) -> Option<String> {
        let mut map = self.inner.lock().unwrap();
        let popped = match self.live(&mut map, key).map(|e| &mut e.value) {
            Some(ValueKind::List(list)) => list.pop(),
            _ => None,
        };
        Self::drop_if_empty(&mut map, key);
        popped
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::List(list)) => match normalize_range(start, stop, list.len()) {
                Some((lo, hi)) => list[lo..=hi].to_vec(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn llen(&self, key: &str) -> usize {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::List(list)) => list.len(),
            _ => 0,
        }
    }

    fn lindex(&self, key: &str, index: i64) -> Option<String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::List(list)) => {
                normalize_index(index, list.len()).map(|i| list[i].clone())
            }
            _ => None,
        }
    }

    fn ltrim(&self, key: &str, start: i64, stop: i64) {
        let mut map = self.inner.lock().unwrap();
        if let Some(ValueKind::List(list)) = self.live(&mut map, key).map(|e| &mut e.value) {
            match normalize_range(start, stop, list.len()) {
                Some((lo, hi)) => {
                    list.truncate(hi + 1);
                    list.drain(..lo);
                }
                None => list.clear(),
            }
        }
        Self::drop_if_empty(&mut map, key);
    }

    fn zadd(&self, key: &str, member: &str, score: f64) {
        let mut map = self.inner.lock().unwrap();
        let entry = self.entry_of(
            &mut map,
            key,
            || ValueKind::Zset(BTreeMap::new()),
            |v| matches!(v, ValueKind::Zset(_)),
        );
        let ValueKind::Zset(zset) = &mut entry.value else {
            unreachable!()
        };
        zset.insert(member.to_string(), score);
    }

    fn zrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        let ordered = self.zset_ordered(key);
        match normalize_range(start, stop, ordered.len()) {
            Some((lo, hi)) => ordered[lo..=hi].to_vec(),
            None => Vec::new(),
        }
    }

    fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        let mut ordered = self.zset_ordered(key);
        ordered.reverse();
        match normalize_range(start, stop, ordered.len()) {
            Some((lo, hi)) => ordered[lo..=hi].to_vec(),
            None => Vec::new(),
        }
    }

    fn zrem(&self, key: &str, members: &[String]) {
        let mut map = self.inner.lock().unwrap();
        if let Some(ValueKind::Zset(zset)) = self.live(&mut map, key).map(|e| &mut e.value) {
            for member in members {
                zset.remove(member);
            }
        }
        Self::drop_if_empty(&mut map, key);
    }

    fn zcard(&self, key: &str) -> usize {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Zset(zset)) => zset.len(),
            _ => 0,
        }
    }

    fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Zset(zset)) => zset.get(member).copied(),
            _ => None,
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut map = self.inner.lock().unwrap();
        let now = self.clock.now();
        map.retain(|_, e| !matches!(e.expires_at, Some(at) if at <= now));
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn stream_append(&self, key: &str, entry: &str, maxlen: usize) {
        let mut map = self.inner.lock().unwrap();
        let slot = self.entry_of(
            &mut map,
            key,
            || ValueKind::List(Vec::new()),
            |v| matches!(v, ValueKind::List(_)),
        );
        let ValueKind::List(list) = &mut slot.value else {
            unreachable!()
        };
        list.push(entry.to_string());
        if list.len() > maxlen {
            let excess = list.len() - maxlen;
            list.drain(..excess);
        }
    }

    fn stream_len(&self, key: &str) -> usize {
        self.llen(key)
    }

    fn publish(&self, channel: &str, message: &str) {
        let channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(channel) {
            // No receivers is fine; the side channel is purely advisory.
            let _ = tx.send(message.to_string());
        }
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }
}

impl MemoryStore {
    fn zset_ordered(&self, key: &str) -> Vec<String> {
        let mut map = self.inner.lock().unwrap();
        match self.live(&mut map, key).map(|e| &e.value) {
            Some(ValueKind::Zset(zset)) => {
                let mut pairs: Vec<(&String, &f64)> = zset.iter().collect();
                pairs.sort_by(|a, b| {
                    a.1.partial_cmp(b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(b.0))
                });
                pairs.into_iter().map(|(m, _)| m.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ManualClock;

    use super::*;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (MemoryStore::new(clock.clone()), clock)
    }

    // ── strings and TTLs ─────────────────────────────────────────────────

    #[test]
    fn set_get_del() {
        let store = MemoryStore::default();
        store.set("k", "v");
        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert!(store.del("k"));
        assert_eq!(store.get("k"), None);
        assert!(!store.del("k"));
    }

    #[test]
    fn set_ex_expires() {
        let (store, clock) = store_with_clock();
        store.set_ex("k", "v", 10);
        assert!(store.exists("k"));
        clock.advance(11.0);
        assert!(!store.exists("k"));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn set_nx_respects_live_key_and_reclaims_expired() {
        let (store, clock) = store_with_clock();
        assert!(store.set_nx_ex("k", "a", 10));
        assert!(!store.set_nx_ex("k", "b", 10));
        assert_eq!(store.get("k").as_deref(), Some("a"));
        clock.advance(11.0);
        assert!(store.set_nx_ex("k", "b", 10));
        assert_eq!(store.get("k").as_deref(), Some("b"));
    }

    #[test]
    fn plain_set_clears_ttl() {
        let (store, clock) = store_with_clock();
        store.set_ex("k", "v", 10);
        store.set("k", "v2");
        clock.advance(100.0);
        assert_eq!(store.get("k").as_deref(), Some("v2"));
    }

    #[test]
    fn expire_refreshes_ttl() {
        let (store, clock) = store_with_clock();
        store.set_ex("k", "v", 10);
        clock.advance(8.0);
        store.expire("k", 10);
        clock.advance(8.0);
        assert!(store.exists("k"));
        clock.advance(3.0);
        assert!(!store.exists("k"));
    }

    #[test]
    fn incr_counts_from_zero() {
        let store = MemoryStore::default();
        assert_eq!(store.incr("n"), 1);
        assert_eq!(store.incr("n"), 2);
        store.set("n", "41");
        assert_eq!(store.incr("n"), 42);
    }

    // ── sets ─────────────────────────────────────────────────────────────

    #[test]
    fn set_membership() {
        let store = MemoryStore::default();
        assert!(store.sadd("s", "a"));
        assert!(!store.sadd("s", "a"));
        store.sadd("s", "b");
        assert!(store.sismember("s", "a"));
        assert_eq!(store.smembers("s").len(), 2);
        assert!(store.srem("s", "a"));
        assert!(!store.sismember("s", "a"));
    }

    #[test]
    fn empty_set_key_disappears() {
        let store = MemoryStore::default();
        store.sadd("s", "a");
        store.srem("s", "a");
        assert!(!store.exists("s"));
    }

    // ── lists ────────────────────────────────────────────────────────────

    #[test]
    fn list_push_pop_range() {
        let store = MemoryStore::default();
        store.rpush("l", &["a".into(), "b".into(), "c".into()]);
        assert_eq!(store.llen("l"), 3);
        assert_eq!(store.lindex("l", -1).as_deref(), Some("c"));
        assert_eq!(store.lindex("l", 0).as_deref(), Some("a"));
        assert_eq!(store.lrange("l", 0, -1), vec!["a", "b", "c"]);
        assert_eq!(store.lrange("l", -2, -1), vec!["b", "c"]);
        assert_eq!(store.rpop("l").as_deref(), Some("c"));
        assert_eq!(store.llen("l"), 2);
    }

    #[test]
    fn ltrim_keeps_inclusive_window() {
        let store = MemoryStore::default();
        store.rpush("l", &["a".into(), "b".into(), "c".into(), "d".into()]);
        store.ltrim("l", 1, 2);
        assert_eq!(store.lrange("l", 0, -1), vec!["b", "c"]);
        // left-trim idiom: keep the newest two
        store.rpush("l", &["e".into(), "f".into()]);
        store.ltrim("l", -2, -1);
        assert_eq!(store.lrange("l", 0, -1), vec!["e", "f"]);
    }

    #[test]
    fn lrange_out_of_bounds_is_empty() {
        let store = MemoryStore::default();
        store.rpush("l", &["a".into()]);
        assert!(store.lrange("l", 5, 10).is_empty());
        assert!(store.lrange("missing", 0, -1).is_empty());
    }

    // ── sorted sets ──────────────────────────────────────────────────────

    #[test]
    fn zset_orders_by_score_then_member() {
        let store = MemoryStore::default();
        store.zadd("z", "b", 2.0);
        store.zadd("z", "a", 1.0);
        store.zadd("z", "c", 2.0);
        assert_eq!(store.zrange("z", 0, -1), vec!["a", "b", "c"]);
        assert_eq!(store.zrevrange("z", 0, 0), vec!["c"]);
        assert_eq!(store.zcard("z"), 3);
        assert_eq!(store.zscore("z", "b"), Some(2.0));
        store.zrem("z", &["b".into()]);
        assert_eq!(store.zrange("z", 0, -1), vec!["a", "c"]);
    }

    // ── scans / streams / pubsub ─────────────────────────────────────────

    #[test]
    fn prefix_scan_skips_expired() {
        let (store, clock) = store_with_clock();
        store.set("stack:c1:a1", "x");
        store.set_ex("stack:c1:a2", "y", 5);
        store.set("other", "z");
        clock.advance(6.0);
        assert_eq!(store.keys_with_prefix("stack:c1:"), vec!["stack:c1:a1"]);
    }

    #[test]
    fn stream_is_capped() {
        let store = MemoryStore::default();
        for i in 0..10 {
            store.stream_append("st", &format!("e{i}"), 4);
        }
        assert_eq!(store.stream_len("st"), 4);
        assert_eq!(store.lrange("st", 0, 0), vec!["e6"]);
    }

    #[test]
    fn pubsub_delivers_to_subscriber() {
        let store = MemoryStore::default();
        let mut rx = store.subscribe("branch");
        store.publish("branch", "deadbeef");
        assert_eq!(rx.try_recv().unwrap(), "deadbeef");
    }

    #[test]
    fn publish_without_subscriber_is_silent() {
        let store = MemoryStore::default();
        store.publish("nobody", "msg");
    }
}
