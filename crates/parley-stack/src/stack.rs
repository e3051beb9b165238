// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, warn};

use parley_artifacts::{ArtifactBus, ArtifactHeader};
use parley_config::StackConfig;
use parley_states::{decode, encode_with_threshold, CodecError, Envelope, State};
use parley_store::{Clock, Store};

use crate::keys;

/// Shared handles every stack and session needs.  Cheap to clone.
#[derive(Clone)]
pub struct StackContext {
    pub store: Arc<dyn Store>,
    pub bus: Arc<ArtifactBus>,
    pub clock: Arc<dyn Clock>,
    pub config: StackConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("index {index} out of range for branch '{branch}' with length {length}")]
    IndexOutOfRange {
        index: i64,
        branch: String,
        length: usize,
    },
    #[error("branch '{0}' does not exist")]
    UnknownBranch(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One decoded frame: the state plus its server-side push timestamp.
#[derive(Debug, Clone)]
pub struct StackEntry {
    pub state: State,
    pub ts: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchInfo {
    pub branch_id: String,
    pub length: usize,
    pub last_ts: Option<f64>,
    pub is_current: bool,
}

/// Append-only state log for one (conversation, agent), with copy-on-write
/// branching.  The current-branch pointer selects where a fresh push lands.
pub struct InteractionStack {
    ctx: StackContext,
    conversation_id: String,
    agent_id: String,
}

impl InteractionStack {
    pub fn new(ctx: StackContext, conversation_id: &str, agent_id: &str) -> Self {
        Self {
            ctx,
            conversation_id: conversation_id.to_string(),
            agent_id: agent_id.to_string(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.ctx.store
    }

    fn base_key(&self) -> String {
        keys::stack_base(&self.conversation_id, &self.agent_id)
    }

    pub(crate) fn branch_key(&self, branch: &str) -> String {
        keys::stack_branch(&self.conversation_id, &self.agent_id, branch)
    }

    pub(crate) fn pointer_key(&self) -> String {
        keys::branch_pointer(&self.conversation_id, &self.agent_id)
    }

    pub fn current_branch(&self) -> String {
        self.ctx
            .store
            .get(&self.pointer_key())
            .unwrap_or_else(|| "main".to_string())
    }

    /// Push one or more states onto the current branch and persist each as
    /// an artifact.
    ///
    /// Includes *lazy* registration: the first state an agent ever emits in
    /// a conversation registers it in the membership set and puts the
    /// conversation on the active list, so silent helpers that never speak
    /// stay invisible.
    ///
    /// If the current top is `Finished` it is popped first; pushing a lone
    /// `Finished` onto a finished top is a no-op.
    pub fn push(&self, states: &[State]) {
        self.push_with_group(states, None)
    }

    pub fn push_with_group(&self, states: &[State], group_id: Option<&str>) {
        if states.is_empty() {
            return;
        }
        let store = &self.ctx.store;

        let agents_key = keys::session_agents(&self.conversation_id);
        if !store.sismember(&agents_key, &self.agent_id) {
            store.sadd(&agents_key, &self.agent_id);
            store.sadd(keys::ACTIVE_SESSIONS, &self.conversation_id);
            // Seed the liveness heartbeat so the driver does not collect
            // the agent before its first acknowledged tick.
            let tick = store
                .get(&keys::session_tick(&self.conversation_id))
                .unwrap_or_else(|| "0".to_string());
            store.hset(
                &keys::agent_last_active(&self.conversation_id),
                &self.agent_id,
                &tick,
            );
        }

        let top = self.current(None);
        let top_finished = matches!(&top, Some(e) if e.state.is_terminal());
        if top_finished {
            if states.len() == 1 && states[0].is_terminal() {
                return;
            }
            self.pop(1);
        }

        let branch_id = self.current_branch();
        let key = self.branch_key(&branch_id);
        let ttl = self.ctx.config.key_ttl_secs;
        let now = self.ctx.clock.now();

        let encoded: Vec<String> = states
            .iter()
            .map(|s| {
                let env = encode_with_threshold(s, now, self.ctx.config.gzip_threshold);
                serde_json::to_string(&env).expect("envelope serialization is infallible")
            })
            .collect();
        store.rpush(&key, &encoded);

        let episode_id = self.current_episode_id();
        let (team, variant) = self.rollout_provenance();

        for state in states {
            let mut header = ArtifactHeader::for_state(
                &self.conversation_id,
                &self.agent_id,
                &branch_id,
            );
            header.ref_id = parley_artifacts::generate_ref();
            header.episode_id = episode_id.clone();
            header.group_id = group_id.map(str::to_string);
            header.ts = now;
            header
                .meta
                .insert("state_kind".to_string(), json!(state.tag()));
            if let Some(team) = &team {
                header.meta.insert("team_id".to_string(), json!(team));
            }
            if let Some(variant) = &variant {
                header.meta.insert("variant_id".to_string(), json!(variant));
            }
            if state.is_terminal() {
                header.meta.insert("is_terminal".to_string(), json!(true));
            }

            self.chain_parent_refs(state, &mut header, ttl);

            let payload = state_payload(state);
            if let Err(e) = self.ctx.bus.publish(header, &payload) {
                error!(
                    conversation_id = self.conversation_id,
                    agent_id = self.agent_id,
                    error = %e,
                    "artifact publish failed"
                );
            }
        }

        let max_len = self.ctx.config.max_len;
        if store.llen(&key) > max_len {
            store.ltrim(&key, -(max_len as i64), -1);
        }
        store.expire(&key, ttl);
    }

    /// Record ref pointers that let results link back to the calls that
    /// caused them, and stamp `parent_refs` on result artifacts.
    fn chain_parent_refs(&self, state: &State, header: &mut ArtifactHeader, ttl: u64) {
        let store = &self.ctx.store;
        match state {
            State::ToolCall { id, .. } => {
                header.state_id = Some(id.clone());
                let key = keys::toolcall_ref(&self.conversation_id, &self.agent_id);
                store.hset(&key, id, &header.ref_id);
                store.expire(&key, ttl);
            }
            State::ToolResult { tool_call_id, .. } => {
                let key = keys::toolcall_ref(&self.conversation_id, &self.agent_id);
                if let Some(parent) = store.hget(&key, tool_call_id) {
                    header.parent_refs = vec![parent];
                }
            }
            State::AgentCall { .. } => {
                store.set_ex(
                    &keys::last_agentcall_ref(&self.conversation_id, &self.agent_id),
                    &header.ref_id,
                    ttl,
                );
            }
            State::AgentResult { correlation_id, .. } => {
                let key = keys::agentcall_ref(&self.conversation_id, &self.agent_id);
                if let Some(parent) = store.hget(&key, correlation_id) {
                    header.parent_refs = vec![parent];
                }
                store.expire(&key, ttl);
            }
            State::AssistantMessage { .. } => {
                store.set_ex(
                    &keys::last_assistant_ref(&self.conversation_id, &self.agent_id),
                    &header.ref_id,
                    ttl,
                );
            }
            _ => {}
        }
    }

    /// Remove up to `n` entries from the top of the current branch.
    pub fn pop(&self, n: usize) -> Vec<State> {
        let key = self.branch_key(&self.current_branch());
        let mut out = Vec::new();
        for _ in 0..n {
            let Some(raw) = self.ctx.store.rpop(&key) else {
                break;
            };
            match decode_raw(&raw) {
                Ok(entry) => out.push(entry.state),
                Err(e) => warn!(error = %e, "dropping undecodable entry on pop"),
            }
        }
        if !out.is_empty() {
            self.ctx.store.expire(&key, self.ctx.config.key_ttl_secs);
        }
        out
    }

    /// Entry at `index` (negative counts from the top).
    pub fn at(&self, index: i64, branch: Option<&str>) -> Result<StackEntry, StackError> {
        let branch = branch.map(str::to_string).unwrap_or_else(|| self.current_branch());
        let key = self.branch_key(&branch);
        match self.ctx.store.lindex(&key, index) {
            Some(raw) => Ok(decode_raw(&raw)?),
            None => Err(StackError::IndexOutOfRange {
                index,
                branch,
                length: self.ctx.store.llen(&key),
            }),
        }
    }

    pub fn current(&self, branch: Option<&str>) -> Option<StackEntry> {
        self.at(-1, branch).ok()
    }

    pub fn length(&self, branch: Option<&str>) -> usize {
        let branch = branch.map(str::to_string).unwrap_or_else(|| self.current_branch());
        self.ctx.store.llen(&self.branch_key(&branch))
    }

    /// Newest `n` entries of the current branch, oldest first.  Entries
    /// that fail to decode are skipped.
    pub fn iter_last_n(&self, n: usize) -> Vec<StackEntry> {
        let key = self.branch_key(&self.current_branch());
        self.ctx
            .store
            .lrange(&key, -(n as i64), -1)
            .iter()
            .filter_map(|raw| match decode_raw(raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable entry");
                    None
                }
            })
            .collect()
    }

    /// Every discovered branch with its length, newest timestamp and
    /// whether it is the current one, sorted by id.
    pub fn get_branch_info(&self) -> Vec<BranchInfo> {
        let current = self.current_branch();
        let mut out = Vec::new();
        for branch_id in self.all_branch_ids() {
            let key = self.branch_key(&branch_id);
            let length = self.ctx.store.llen(&key);
            let last_ts = self
                .ctx
                .store
                .lindex(&key, -1)
                .and_then(|raw| decode_raw(&raw).ok())
                .map(|e| e.ts);
            out.push(BranchInfo {
                is_current: branch_id == current,
                branch_id,
                length,
                last_ts,
            });
        }
        out
    }

    pub(crate) fn all_branch_ids(&self) -> Vec<String> {
        let base = self.base_key();
        let prefix = format!("{base}:");
        let mut found = vec!["main".to_string()];
        let suffix_re = regex::Regex::new("^[0-9a-f]{8}$").expect("static regex");
        for key in self.ctx.store.keys_with_prefix(&prefix) {
            let rest = &key[prefix.len()..];
            if suffix_re.is_match(rest) {
                found.push(rest.to_string());
            }
        }
        found.sort();
        found.dedup();
        found
    }

    /// Most recent non-empty assistant text within the newest 100 entries.
    pub fn last_assistant_message(&self) -> Option<String> {
        self.iter_last_n(100)
            .into_iter()
            .rev()
            .find_map(|entry| match entry.state {
                State::AssistantMessage {
                    content: Some(text),
                    ..
                } if !text.is_empty() => Some(text),
                _ => None,
            })
    }

    /// The agent that delegated to this one, if any.
    pub fn parent_agent_id(&self) -> Option<String> {
        self.ctx
            .store
            .get(&keys::child_to_parent(&self.conversation_id, &self.agent_id))
    }

    /// Correlation id of the in-flight delegation targeting this agent.
    pub fn correlation_id(&self) -> Option<String> {
        self.ctx.store.get(&keys::agent_call_correlation(
            &self.conversation_id,
            &self.agent_id,
        ))
    }

    /// Episode grouping key for the current branch, minted on first use.
    pub fn current_episode_id(&self) -> String {
        let branch = self.current_branch();
        let key = keys::episode(&self.conversation_id, &self.agent_id, &branch);
        if let Some(id) = self.ctx.store.get(&key) {
            return id;
        }
        let id = new_short_id();
        self.ctx
            .store
            .set_ex(&key, &id, self.ctx.config.key_ttl_secs);
        id
    }

    fn rollout_provenance(&self) -> (Option<String>, Option<String>) {
        (
            self.ctx.store.get(&keys::rollout_team(&self.conversation_id)),
            self.ctx
                .store
                .get(&keys::rollout_variant(&self.conversation_id)),
        )
    }

    pub(crate) fn context(&self) -> &StackContext {
        &self.ctx
    }
}

/// 8-hex id for branches and episodes.
pub(crate) fn new_short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub(crate) fn decode_raw(raw: &str) -> Result<StackEntry, StackError> {
    let env: Envelope = serde_json::from_str(raw)
        .map_err(|e| StackError::Codec(CodecError::Json(e)))?;
    let state = decode(&env)?;
    Ok(StackEntry { state, ts: env.ts })
}

fn state_payload(state: &State) -> Value {
    let mut value = serde_json::to_value(state).expect("state serialization is infallible");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("t");
    }
    value
}

#[cfg(test)]
pub(crate) mod tests {
    use parley_artifacts::MemoryDriver;
    use parley_store::{ManualClock, MemoryStore};
    use serde_json::Map;

    use super::*;

    pub(crate) fn test_context() -> (StackContext, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(clock.clone()));
        let bus = Arc::new(ArtifactBus::new(
            store.clone(),
            Box::new(MemoryDriver::default()),
            clock.clone(),
            100_000,
        ));
        (
            StackContext {
                store,
                bus,
                clock: clock.clone(),
                config: StackConfig::default(),
            },
            clock,
        )
    }

    fn stack(ctx: &StackContext) -> InteractionStack {
        InteractionStack::new(ctx.clone(), "c1", "a1")
    }

    fn tool_call(id: &str) -> State {
        let mut args = Map::new();
        args.insert("x".into(), json!(1));
        State::ToolCall {
            id: id.into(),
            function_name: "echo".into(),
            arguments: args,
        }
    }

    fn tool_result(id: &str) -> State {
        let mut result = Map::new();
        result.insert("status".into(), json!("ok"));
        State::ToolResult {
            tool_call_id: id.into(),
            tool_name: "echo".into(),
            result,
            arguments: None,
            reward: Some(1.0),
        }
    }

    // ── push / pop ───────────────────────────────────────────────────────

    #[test]
    fn push_appends_and_reads_back() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::user("hi"), State::assistant("hello")]);
        assert_eq!(s.length(None), 2);
        assert_eq!(s.at(0, None).unwrap().state, State::user("hi"));
        assert_eq!(s.current(None).unwrap().state, State::assistant("hello"));
    }

    #[test]
    fn push_lazily_registers_agent_and_session() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        assert!(!ctx.store.sismember(&keys::session_agents("c1"), "a1"));
        s.push(&[State::user("hi")]);
        assert!(ctx.store.sismember(&keys::session_agents("c1"), "a1"));
        assert!(ctx.store.sismember(keys::ACTIVE_SESSIONS, "c1"));
    }

    #[test]
    fn push_onto_finished_pops_the_marker_first() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::user("hi"), State::Finished]);
        s.push(&[State::user("again")]);
        assert_eq!(s.length(None), 2);
        assert_eq!(s.current(None).unwrap().state, State::user("again"));
    }

    #[test]
    fn duplicate_finished_is_a_noop() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::user("hi"), State::Finished]);
        let stream_before = ctx.store.stream_len("stream:artifacts");
        s.push(&[State::Finished]);
        assert_eq!(s.length(None), 2);
        // no artifact event either
        assert_eq!(ctx.store.stream_len("stream:artifacts"), stream_before);
    }

    #[test]
    fn pop_returns_newest_first_and_respects_bounds() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::user("a"), State::user("b")]);
        let popped = s.pop(5);
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0], State::user("b"));
        assert_eq!(s.length(None), 0);
    }

    #[test]
    fn branch_is_left_trimmed_at_max_len() {
        let (mut ctx, _) = test_context();
        ctx.config.max_len = 3;
        let s = stack(&ctx);
        for i in 0..5 {
            s.push(&[State::user(format!("m{i}"))]);
        }
        assert_eq!(s.length(None), 3);
        assert_eq!(s.at(0, None).unwrap().state, State::user("m2"));
    }

    // ── parent-ref chaining ──────────────────────────────────────────────

    #[test]
    fn tool_result_links_to_its_tool_call() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[tool_call("h1")]);
        let call_ref = ctx
            .store
            .hget(&keys::toolcall_ref("c1", "a1"), "h1")
            .unwrap();
        s.push(&[tool_result("h1")]);

        let rows = ctx.bus.read_last_n(1, "c1", None);
        assert_eq!(rows[0].0.parent_refs, vec![call_ref]);
    }

    #[test]
    fn assistant_push_records_last_assistant_ref() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::assistant("yo")]);
        assert!(ctx
            .store
            .get(&keys::last_assistant_ref("c1", "a1"))
            .is_some());
    }

    #[test]
    fn agent_result_links_through_correlation_map() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::AgentCall {
            agent_id: "child".into(),
            message: "go".into(),
        }]);
        let call_ref = ctx
            .store
            .get(&keys::last_agentcall_ref("c1", "a1"))
            .unwrap();
        // the delegation handler moves the pending ref under its correlation id
        ctx.store
            .hset(&keys::agentcall_ref("c1", "a1"), "corr-9", &call_ref);

        let mut result = Map::new();
        result.insert("content".into(), json!("done"));
        s.push(&[State::AgentResult {
            correlation_id: "corr-9".into(),
            result,
            score: None,
        }]);
        let rows = ctx.bus.read_last_n(1, "c1", None);
        assert_eq!(rows[0].0.parent_refs, vec![call_ref]);
    }

    // ── reads ────────────────────────────────────────────────────────────

    #[test]
    fn iter_last_n_is_oldest_first() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[State::user("a"), State::user("b"), State::user("c")]);
        let last2: Vec<State> = s.iter_last_n(2).into_iter().map(|e| e.state).collect();
        assert_eq!(last2, vec![State::user("b"), State::user("c")]);
    }

    #[test]
    fn last_assistant_message_skips_empty_content() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        s.push(&[
            State::assistant("first"),
            State::AssistantMessage {
                content: None,
                tool_calls: None,
                meta: None,
            },
        ]);
        assert_eq!(s.last_assistant_message().as_deref(), Some("first"));
    }

    #[test]
    fn episode_id_is_sticky_per_branch() {
        let (ctx, _) = test_context();
        let s = stack(&ctx);
        let ep1 = s.current_episode_id();
        let ep2 = s.current_episode_id();
        assert_eq!(ep1, ep2);
        assert_eq!(ep1.len(), 8);
    }

    #[test]
    fn rollout_tags_land_in_artifact_meta() {
        let (ctx, _) = test_context();
        ctx.store.set(&keys::rollout_team("c1"), "red");
        let s = stack(&ctx);
        s.push(&[State::user("hi")]);
        let rows = ctx.bus.read_last_n(1, "c1", None);
        assert_eq!(rows[0].0.meta["team_id"], json!("red"));
    }
}
