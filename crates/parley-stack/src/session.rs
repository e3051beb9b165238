// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use tracing::{debug, info};

use parley_states::State;

use crate::keys;
use crate::{InteractionStack, StackContext};

/// Seed frame pushed onto an empty branch so lazily-joined agents have
/// something to act on.  Hidden from rendered transcripts.
pub const SYNTHETIC_SEED: &str = "<!-- synthetic seed -->";

/// Per-conversation registry: membership, finished set, tick counter and
/// waiting sets.  A thin, stateless view over the store — cheap to build
/// wherever a worker needs one.
pub struct Session {
    ctx: StackContext,
    conversation_id: String,
}

impl Session {
    pub fn new(ctx: StackContext, conversation_id: &str) -> Self {
        Self {
            ctx,
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Add an agent to the membership set, putting the conversation on the
    /// active list when it goes empty → non-empty.
    pub fn register_agent(&self, agent_id: &str) {
        let key = keys::session_agents(&self.conversation_id);
        if self.ctx.store.sadd(&key, agent_id)
            && !self
                .ctx
                .store
                .sismember(keys::ACTIVE_SESSIONS, &self.conversation_id)
        {
            self.ctx
                .store
                .sadd(keys::ACTIVE_SESSIONS, &self.conversation_id);
            info!(
                session_id = self.conversation_id,
                agent_id, "session registered in active set"
            );
        }
    }

    /// Remove an agent.  Without `force` this is a soft no-op; with it the
    /// conversation is retired from the active set once no live agents
    /// remain.
    pub fn unregister_agent(&self, agent_id: &str, force: bool) {
        if !force {
            debug!(
                session_id = self.conversation_id,
                agent_id, "soft unregister ignored"
            );
            return;
        }
        self.ctx
            .store
            .srem(&keys::session_agents(&self.conversation_id), agent_id);
        if self.agents().is_empty() {
            self.ctx
                .store
                .srem(keys::ACTIVE_SESSIONS, &self.conversation_id);
            info!(
                session_id = self.conversation_id,
                "session retired, no live agents"
            );
        }
    }

    pub fn agents(&self) -> BTreeSet<String> {
        self.ctx
            .store
            .smembers(&keys::session_agents(&self.conversation_id))
    }

    pub fn finished(&self) -> BTreeSet<String> {
        self.ctx
            .store
            .smembers(&keys::session_finished(&self.conversation_id))
    }

    pub fn live_agents(&self) -> BTreeSet<String> {
        self.agents()
            .difference(&self.finished())
            .cloned()
            .collect()
    }

    pub fn is_finished(&self, agent_id: &str) -> bool {
        self.ctx
            .store
            .sismember(&keys::session_finished(&self.conversation_id), agent_id)
    }

    pub fn add_finished(&self, agent_id: &str) {
        self.ctx
            .store
            .sadd(&keys::session_finished(&self.conversation_id), agent_id);
    }

    // ── tick bookkeeping ─────────────────────────────────────────────────

    pub fn tick(&self) -> u64 {
        self.ctx
            .store
            .get(&keys::session_tick(&self.conversation_id))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_tick(&self, tick: u64) {
        self.ctx
            .store
            .set(&keys::session_tick(&self.conversation_id), &tick.to_string());
    }

    pub fn waiting(&self, tick: u64) -> BTreeSet<String> {
        self.ctx
            .store
            .smembers(&keys::session_waiting(&self.conversation_id, tick))
    }

    pub fn tick_start(&self, tick: u64) -> Option<f64> {
        self.ctx
            .store
            .get(&keys::tick_start_time(&self.conversation_id, tick))
            .and_then(|raw| raw.parse().ok())
    }

    /// Record that an agent completed work against `tick`, so the driver
    /// can tell it apart from a dead agent on the next advance.
    pub fn ack_tick(&self, agent_id: &str, tick: u64) {
        let key = keys::agent_last_active(&self.conversation_id);
        self.ctx
            .store
            .hset(&key, agent_id, &tick.to_string());
        self.ctx.store.expire(&key, self.ctx.config.key_ttl_secs);
    }

    // ── conversation metadata ────────────────────────────────────────────

    pub fn set_interactive_cli(&self, on: bool) {
        let key = keys::conversation_is_cli(&self.conversation_id);
        if on {
            self.ctx.store.set(&key, "1");
        } else {
            self.ctx.store.del(&key);
        }
    }

    pub fn is_interactive_cli(&self) -> bool {
        self.ctx
            .store
            .exists(&keys::conversation_is_cli(&self.conversation_id))
    }

    pub fn set_mode(&self, mode: &str) {
        self.ctx
            .store
            .set(&keys::conversation_mode(&self.conversation_id), mode);
    }

    pub fn set_rollout_tags(&self, team: Option<&str>, variant: Option<&str>) {
        if let Some(team) = team {
            self.ctx
                .store
                .set(&keys::rollout_team(&self.conversation_id), team);
        }
        if let Some(variant) = variant {
            self.ctx
                .store
                .set(&keys::rollout_variant(&self.conversation_id), variant);
        }
    }

    /// Destroy the conversation: every branch, auxiliary pointer,
    /// coordination key and artifact goes away.
    pub fn destroy(&self) {
        let conversation = &self.conversation_id;
        self.ctx.bus.destroy_session(conversation);

        for prefix in [
            format!("stack:{conversation}:"),
            format!("session:{conversation}:"),
            format!("conversation:{conversation}:"),
            format!("dedup:{conversation}:"),
            format!("expect_agent_result:{conversation}:"),
            format!("child_to_parent:{conversation}:"),
            format!("agent_call_correlation:{conversation}:"),
            format!("finished_once:{conversation}:"),
            format!("agent_finished_event:{conversation}:"),
            format!("round_by_branch:{conversation}:"),
        ] {
            for key in self.ctx.store.keys_with_prefix(&prefix) {
                self.ctx.store.del(&key);
            }
        }
        for key in [
            keys::agent_last_active(conversation),
            keys::tick_fence(conversation),
            keys::tick_advance_fence(conversation),
            keys::response(conversation),
            keys::effect_log(conversation),
            keys::rollout_team(conversation),
            keys::rollout_variant(conversation),
        ] {
            self.ctx.store.del(&key);
        }
        self.ctx.store.srem(keys::ACTIVE_SESSIONS, conversation);
        info!(session_id = conversation, "conversation destroyed");
    }

    // ── stacks ───────────────────────────────────────────────────────────

    /// Stack for an agent, registering it and seeding an empty branch with
    /// a synthetic user frame (unless the main branch already terminated).
    pub fn stack_for(&self, agent_id: &str) -> InteractionStack {
        let stack = InteractionStack::new(self.ctx.clone(), &self.conversation_id, agent_id);
        self.register_agent(agent_id);

        if stack.length(None) == 0 {
            let main_terminated = matches!(
                stack.current(Some("main")),
                Some(entry) if entry.state.is_terminal()
            );
            if !main_terminated {
                stack.push(&[State::user(SYNTHETIC_SEED)]);
            }
        }
        stack
    }
}

#[cfg(test)]
mod tests {
    use crate::stack::tests::test_context;

    use super::*;

    fn session(ctx: &StackContext) -> Session {
        Session::new(ctx.clone(), "c1")
    }

    #[test]
    fn register_and_retire() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        s.register_agent("a1");
        s.register_agent("a2");
        assert!(ctx.store.sismember(keys::ACTIVE_SESSIONS, "c1"));
        s.unregister_agent("a1", true);
        assert!(ctx.store.sismember(keys::ACTIVE_SESSIONS, "c1"));
        s.unregister_agent("a2", true);
        assert!(!ctx.store.sismember(keys::ACTIVE_SESSIONS, "c1"));
    }

    #[test]
    fn soft_unregister_is_ignored() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        s.register_agent("a1");
        s.unregister_agent("a1", false);
        assert!(s.agents().contains("a1"));
    }

    #[test]
    fn live_agents_excludes_finished() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        s.register_agent("a1");
        s.register_agent("a2");
        s.add_finished("a1");
        assert!(s.is_finished("a1"));
        assert_eq!(s.live_agents(), ["a2".to_string()].into());
    }

    #[test]
    fn tick_counter_starts_at_zero() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        assert_eq!(s.tick(), 0);
        s.set_tick(3);
        assert_eq!(s.tick(), 3);
    }

    #[test]
    fn stack_for_seeds_empty_branch() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        let stack = s.stack_for("a1");
        assert_eq!(stack.length(None), 1);
        assert_eq!(
            stack.current(None).unwrap().state,
            State::user(SYNTHETIC_SEED)
        );
        // idempotent: a second lookup does not re-seed
        let stack = s.stack_for("a1");
        assert_eq!(stack.length(None), 1);
    }

    #[test]
    fn stack_for_does_not_seed_empty_branch_after_terminal_main() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        let stack = s.stack_for("a1");
        stack.push(&[State::Finished]);
        // point at a branch whose key has lapsed; main's terminal marker
        // must suppress re-seeding
        ctx.store.set(&keys::branch_pointer("c1", "a1"), "deadbeef");

        let stack = s.stack_for("a1");
        assert_eq!(stack.length(None), 0);
    }

    #[test]
    fn destroy_removes_branches_artifacts_and_coordination_keys() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        let stack = s.stack_for("a1");
        stack.push(&[State::user("hi"), State::assistant("yo")]);
        ctx.store.set(&keys::response("c1"), "yo");
        ctx.store.set_nx_ex(&keys::dedup("c1", "a1", "main", "h"), "1", 600);
        let ref_id = ctx.bus.read_last_n(1, "c1", None)[0].0.ref_id.clone();

        s.destroy();

        assert_eq!(stack.length(None), 0);
        assert!(ctx.store.get(&keys::response("c1")).is_none());
        assert!(!ctx.store.exists(&keys::dedup("c1", "a1", "main", "h")));
        assert!(!ctx.store.sismember(keys::ACTIVE_SESSIONS, "c1"));
        assert!(ctx.bus.get(&ref_id).is_err());
        assert!(ctx.bus.read_last_n(10, "c1", None).is_empty());
    }

    #[test]
    fn interactive_cli_flag_round_trips() {
        let (ctx, _) = test_context();
        let s = session(&ctx);
        assert!(!s.is_interactive_cli());
        s.set_interactive_cli(true);
        assert!(s.is_interactive_cli());
        s.set_interactive_cli(false);
        assert!(!s.is_interactive_cli());
    }
}
