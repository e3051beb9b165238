// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use parley_store::{Clock, Store};

use crate::driver::{gunzip, gzip};
use crate::{generate_ref, ArtifactError, ArtifactHeader, StorageDriver};

/// Payloads above this many serialized bytes are stored gzipped.
const PAYLOAD_GZIP_THRESHOLD: usize = 2_048;

/// Cap on the global artifact event stream (approximate, trim-on-append).
const STREAM_MAXLEN: usize = 100_000;

const STREAM_KEY: &str = "stream:artifacts";
const REF_TO_SESSION: &str = "artifacts:ref_to_session";

/// Hook the engine installs so that freshly recorded evaluations are picked
/// up by the `evals` worker pool.
pub trait EvalScheduler: Send + Sync {
    fn schedule(&self, target_ref: &str, evaluator_id: &str, judge_version: &str, payload: Value);
}

/// Durable artifact store plus a thin index that powers fast queries.
pub struct ArtifactBus {
    store: Arc<dyn Store>,
    driver: Box<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    max_per_session: usize,
    scheduler: Mutex<Option<Arc<dyn EvalScheduler>>>,
}

fn headers_key(session: &str) -> String {
    format!("artifacts:{session}:headers")
}

fn index_key(session: &str) -> String {
    format!("artifacts:{session}:index")
}

fn timeline_key(session: &str) -> String {
    format!("artifacts:{session}:timeline")
}

fn scores_key(session: &str) -> String {
    format!("artifacts:{session}:scores")
}

fn episode_key(session: &str, episode: &str) -> String {
    format!("artifacts:{session}:episode:{episode}")
}

fn group_key(session: &str, group: &str) -> String {
    format!("artifacts:{session}:group:{group}")
}

fn next_idx_key(session: &str, branch: &str) -> String {
    format!("artifacts:{session}:{branch}:next_idx")
}

impl ArtifactBus {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Box<dyn StorageDriver>,
        clock: Arc<dyn Clock>,
        max_per_session: usize,
    ) -> Self {
        Self {
            store,
            driver,
            clock,
            max_per_session,
            scheduler: Mutex::new(None),
        }
    }

    /// Install the evaluation scheduler.  Called once during engine wiring;
    /// until then `create_evaluation_for` records the pending artifact but
    /// schedules nothing.
    pub fn set_eval_scheduler(&self, scheduler: Arc<dyn EvalScheduler>) {
        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    /// Persist an artifact: payload to the storage driver, header into the
    /// index, plus timeline / episode / group / score rankings and the
    /// capped event stream.  Missing `ref`/`ts`/`role`/`step_idx` are
    /// assigned here.  Returns the ref.
    pub fn publish(
        &self,
        mut header: ArtifactHeader,
        payload: &Value,
    ) -> Result<String, ArtifactError> {
        if header.ref_id.is_empty() {
            header.ref_id = generate_ref();
        }
        if header.ts == 0.0 {
            header.ts = self.clock.now();
        }
        if header.role.is_empty() {
            header.role = "state".to_string();
        }

        let session = header.session_id.clone();
        let ref_id = header.ref_id.clone();

        // Monotonic per-branch rank; `incr` is the atomic allocation point.
        let step_idx = self.store.incr(&next_idx_key(&session, &header.branch_id)) as u64;
        header.step_idx = Some(step_idx);

        let raw = serde_json::to_vec(payload)?;
        header.compressed = raw.len() > PAYLOAD_GZIP_THRESHOLD;
        let body = if header.compressed { gzip(&raw) } else { raw };
        self.driver
            .write_payload(&session, &ref_id, &body, header.compressed)?;

        let lean = json!({
            "ts": header.ts,
            "role": header.role,
            "branch_id": header.branch_id,
            "mime": header.mime,
            "step_idx": step_idx,
            "episode_id": header.episode_id,
            "group_id": header.group_id,
            "score": header.score,
            "compressed": header.compressed,
            "meta": header.meta,
        });
        let header_json = serde_json::to_string(&header)?;

        self.store
            .hset(&headers_key(&session), &ref_id, &header_json);
        self.store
            .hset(&index_key(&session), &ref_id, &lean.to_string());
        self.store.zadd(&timeline_key(&session), &ref_id, header.ts);
        if !header.episode_id.is_empty() {
            self.store.zadd(
                &episode_key(&session, &header.episode_id),
                &ref_id,
                step_idx as f64,
            );
        }
        if let Some(group) = &header.group_id {
            self.store
                .zadd(&group_key(&session, group), &ref_id, step_idx as f64);
        }
        if let Some(score) = header.score {
            self.store.zadd(&scores_key(&session), &ref_id, score);
        }
        self.store.hset(REF_TO_SESSION, &ref_id, &session);
        self.store
            .stream_append(STREAM_KEY, &header_json, STREAM_MAXLEN);

        debug!(
            ref_id,
            session, step_idx, role = header.role, "artifact published"
        );

        self.maybe_prune(&session);
        Ok(ref_id)
    }

    /// Fetch header and payload for a single ref.
    pub fn get(&self, ref_id: &str) -> Result<(ArtifactHeader, Value), ArtifactError> {
        let header = self.header_by_ref(ref_id)?;
        let bytes =
            self.driver
                .read_payload(&header.session_id, ref_id, header.compressed)?;
        let raw = if header.compressed {
            gunzip(&bytes).map_err(|e| ArtifactError::Storage {
                ref_id: ref_id.to_string(),
                source: e,
            })?
        } else {
            bytes
        };
        let payload = serde_json::from_slice(&raw)?;
        Ok((header, payload))
    }

    /// Atomic header + payload edit.  `meta` patches deep-merge instead of
    /// replacing; every other header field is overwritten.  Object payload
    /// patches merge key-wise, anything else replaces wholesale.
    pub fn patch_artifact(
        &self,
        ref_id: &str,
        header_updates: Option<Map<String, Value>>,
        payload_updates: Option<Value>,
    ) -> Result<(), ArtifactError> {
        let mut header = self.header_by_ref(ref_id)?;
        let session = header.session_id.clone();

        if let Some(mut updates) = header_updates {
            let meta_patch = updates.remove("meta");
            let mut as_value = serde_json::to_value(&header)?;
            let obj = as_value.as_object_mut().expect("header is an object");
            for (k, v) in updates {
                obj.insert(k, v);
            }
            header = serde_json::from_value(as_value)?;
            if let Some(Value::Object(patch)) = meta_patch {
                for (k, v) in patch {
                    header.meta.insert(k, v);
                }
            }
        }

        if let Some(updates) = payload_updates {
            let mut payload = match self.get(ref_id) {
                Ok((_, payload)) => payload,
                Err(e) => {
                    warn!(ref_id, error = %e, "patch could not read payload, replacing");
                    Value::Object(Map::new())
                }
            };
            match (&mut payload, updates) {
                (Value::Object(base), Value::Object(patch)) => {
                    for (k, v) in patch {
                        base.insert(k, v);
                    }
                }
                (slot, replacement) => *slot = replacement,
            }
            let raw = serde_json::to_vec(&payload)?;
            let body = if header.compressed { gzip(&raw) } else { raw };
            self.driver
                .write_payload(&session, ref_id, &body, header.compressed)?;
        }

        // Keep the lean index and score ranking in line with the header.
        if let Some(raw_lean) = self.store.hget(&index_key(&session), ref_id) {
            if let Ok(mut lean) = serde_json::from_str::<Value>(&raw_lean) {
                lean["score"] = json!(header.score);
                lean["meta"] = Value::Object(header.meta.clone());
                self.store
                    .hset(&index_key(&session), ref_id, &lean.to_string());
            }
        }
        if let Some(score) = header.score {
            self.store.zadd(&scores_key(&session), ref_id, score);
        }

        let header_json = serde_json::to_string(&header)?;
        self.store.hset(&headers_key(&session), ref_id, &header_json);
        self.store
            .stream_append(STREAM_KEY, &header_json, STREAM_MAXLEN);
        info!(ref_id, session, "artifact patched");
        Ok(())
    }

    /// Convenience used by the judge worker once it has a score/review.
    pub fn patch_evaluation(
        &self,
        ref_id: &str,
        evaluator_id: &str,
        judge_version: &str,
        score: f64,
        metrics: &Map<String, Value>,
        review: Option<&str>,
        reward: Option<f64>,
    ) -> Result<(), ArtifactError> {
        let mut header_updates = Map::new();
        header_updates.insert("evaluator_id".into(), json!(evaluator_id));
        header_updates.insert("judge_version".into(), json!(judge_version));
        header_updates.insert("score".into(), json!(score));
        header_updates.insert(
            "meta".into(),
            json!({"eval_metrics": metrics, "status": "finished"}),
        );
        if let Some(reward) = reward {
            header_updates.insert("reward".into(), json!(reward));
        }

        let mut payload_updates = Map::new();
        payload_updates.insert("score".into(), json!(score));
        if let Some(review) = review {
            payload_updates.insert("review".into(), json!(review));
        }

        self.patch_artifact(
            ref_id,
            Some(header_updates),
            Some(Value::Object(payload_updates)),
        )
    }

    /// Record a pending evaluation of `target_ref` and hand it to the
    /// installed scheduler.  Session and branch are inferred from the
    /// target's header; the new artifact links back via `parent_refs`.
    pub fn create_evaluation_for(
        &self,
        target_ref: &str,
        evaluator_id: &str,
        judge_version: &str,
        mut payload: Map<String, Value>,
    ) -> Result<String, ArtifactError> {
        let target = self.header_by_ref(target_ref)?;

        let header = ArtifactHeader {
            session_id: target.session_id.clone(),
            branch_id: target.branch_id.clone(),
            agent_id: evaluator_id.to_string(),
            role: "evaluation".to_string(),
            mime: "application/json".to_string(),
            parent_refs: vec![target_ref.to_string()],
            evaluator_id: Some(evaluator_id.to_string()),
            judge_version: Some(judge_version.to_string()),
            meta: json!({"status": "pending", "eval_metrics": {}})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            ..ArtifactHeader::default()
        };

        payload
            .entry("parent_refs".to_string())
            .or_insert_with(|| json!([target_ref]));
        let payload = Value::Object(payload);

        let ref_id = self.publish(header, &payload)?;

        match self.scheduler.lock().unwrap().as_ref() {
            Some(scheduler) => {
                scheduler.schedule(&ref_id, evaluator_id, judge_version, payload)
            }
            None => debug!(ref_id, "no eval scheduler installed, evaluation stays pending"),
        }

        info!(
            ref_id,
            session = target.session_id,
            evaluator = evaluator_id,
            "evaluation created"
        );
        Ok(ref_id)
    }

    /// Oldest `n` artifacts of a session, optionally filtered by role.
    pub fn read_first_n(
        &self,
        n: usize,
        session_id: &str,
        role: Option<&str>,
    ) -> Vec<(ArtifactHeader, Value)> {
        let refs = self.store.zrange(&timeline_key(session_id), 0, n as i64 - 1);
        self.load_filtered(&refs, role)
    }

    /// Newest `n` artifacts of a session, optionally filtered by role.
    pub fn read_last_n(
        &self,
        n: usize,
        session_id: &str,
        role: Option<&str>,
    ) -> Vec<(ArtifactHeader, Value)> {
        let refs = self
            .store
            .zrevrange(&timeline_key(session_id), 0, n as i64 - 1);
        self.load_filtered(&refs, role)
    }

    /// Linear scan newest-first with optional tag / timestamp filters.
    /// Good enough for operator tooling.
    pub fn search(
        &self,
        session_id: &str,
        tag: Option<&str>,
        since: Option<f64>,
        limit: usize,
    ) -> Vec<(ArtifactHeader, Value)> {
        let refs = self.store.zrevrange(&timeline_key(session_id), 0, -1);
        let mut rows = Vec::new();
        for ref_id in refs {
            if rows.len() >= limit {
                break;
            }
            let Ok((header, payload)) = self.get(&ref_id) else {
                continue;
            };
            if let Some(cutoff) = since {
                if header.ts < cutoff {
                    continue;
                }
            }
            if let Some(tag) = tag {
                let tagged = header
                    .meta
                    .get("tags")
                    .and_then(Value::as_array)
                    .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag)));
                if !tagged {
                    continue;
                }
            }
            rows.push((header, payload));
        }
        rows
    }

    fn load_filtered(&self, refs: &[String], role: Option<&str>) -> Vec<(ArtifactHeader, Value)> {
        let mut out = Vec::new();
        for ref_id in refs {
            match self.get(ref_id) {
                Ok((header, payload)) => {
                    if role.is_some_and(|r| header.role != r) {
                        continue;
                    }
                    out.push((header, payload));
                }
                Err(e) => warn!(ref_id, error = %e, "skipping unreadable artifact"),
            }
        }
        out
    }

    /// Remove every artifact of a session: payloads, headers, index,
    /// timeline and rankings.  Used when a conversation is destroyed.
    pub fn destroy_session(&self, session_id: &str) {
        let refs = self.store.zrange(&timeline_key(session_id), 0, -1);
        for ref_id in &refs {
            let compressed = self
                .header_by_ref(ref_id)
                .map(|h| h.compressed)
                .unwrap_or(false);
            if let Err(e) = self.driver.delete_payload(session_id, ref_id, compressed) {
                warn!(ref_id, error = %e, "payload delete failed");
            }
            self.store.hdel(REF_TO_SESSION, ref_id);
        }
        for key in self.store.keys_with_prefix(&format!("artifacts:{session_id}:")) {
            self.store.del(&key);
        }
        info!(session = session_id, removed = refs.len(), "session artifacts destroyed");
    }

    fn header_by_ref(&self, ref_id: &str) -> Result<ArtifactHeader, ArtifactError> {
        let session = self
            .store
            .hget(REF_TO_SESSION, ref_id)
            .ok_or_else(|| ArtifactError::NotFound(ref_id.to_string()))?;
        let raw = self
            .store
            .hget(&headers_key(&session), ref_id)
            .ok_or_else(|| ArtifactError::NotFound(ref_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Enforce the per-session cap by deleting the oldest excess artifacts
    /// from both the index and the storage driver.
    fn maybe_prune(&self, session_id: &str) {
        let tline = timeline_key(session_id);
        let current = self.store.zcard(&tline);
        if current <= self.max_per_session {
            return;
        }
        let excess = (current - self.max_per_session) as i64;
        let old_refs = self.store.zrange(&tline, 0, excess - 1);

        for ref_id in &old_refs {
            let compressed = self
                .header_by_ref(ref_id)
                .map(|h| h.compressed)
                .unwrap_or(false);
            if let Err(e) = self.driver.delete_payload(session_id, ref_id, compressed) {
                warn!(ref_id, error = %e, "payload prune failed");
            }
            self.store.hdel(&index_key(session_id), ref_id);
            self.store.hdel(&headers_key(session_id), ref_id);
            self.store.hdel(REF_TO_SESSION, ref_id);
        }
        self.store.zrem(&tline, &old_refs);
        debug!(session = session_id, removed = old_refs.len(), "pruned");
    }
}
