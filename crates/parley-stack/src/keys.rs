// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical store-key layout.
//!
//! All coordination keys live here so the whole schema can be read in one
//! place.  Keys are flat strings; TTLs are applied by the callers.

/// Global set of conversations with at least one live agent.
pub const ACTIVE_SESSIONS: &str = "active_sessions";

// ── session registry ─────────────────────────────────────────────────────

pub fn session_agents(conversation: &str) -> String {
    format!("session:{conversation}:agents")
}

pub fn session_finished(conversation: &str) -> String {
    format!("session:{conversation}:finished")
}

pub fn session_tick(conversation: &str) -> String {
    format!("session:{conversation}:tick")
}

pub fn session_waiting(conversation: &str, tick: u64) -> String {
    format!("session:{conversation}:waiting:{tick}")
}

pub fn tick_start_time(conversation: &str, tick: u64) -> String {
    format!("session:{conversation}:tick:{tick}:start_time")
}

pub fn agent_last_active(conversation: &str) -> String {
    format!("agent_last_active:{conversation}")
}

// ── conversation metadata ────────────────────────────────────────────────

pub fn conversation_is_cli(conversation: &str) -> String {
    format!("conversation:{conversation}:is_cli")
}

pub fn conversation_mode(conversation: &str) -> String {
    format!("conversation:{conversation}:mode")
}

pub fn rollout_team(conversation: &str) -> String {
    format!("{conversation}:team")
}

pub fn rollout_variant(conversation: &str) -> String {
    format!("{conversation}:variant")
}

// ── interaction stacks ───────────────────────────────────────────────────

pub fn stack_base(conversation: &str, agent: &str) -> String {
    format!("stack:{conversation}:{agent}")
}

/// The `"main"` branch lives directly on the base key; every other branch
/// is suffixed with its 8-hex id.
pub fn stack_branch(conversation: &str, agent: &str, branch: &str) -> String {
    if branch == "main" {
        stack_base(conversation, agent)
    } else {
        format!("{}:{branch}", stack_base(conversation, agent))
    }
}

pub fn branch_pointer(conversation: &str, agent: &str) -> String {
    format!("{}:branch", stack_base(conversation, agent))
}

pub fn episode(conversation: &str, agent: &str, branch: &str) -> String {
    format!("{}:episode:{branch}", stack_base(conversation, agent))
}

pub fn toolcall_ref(conversation: &str, agent: &str) -> String {
    format!("{}:toolcall_ref", stack_base(conversation, agent))
}

pub fn agentcall_ref(conversation: &str, agent: &str) -> String {
    format!("{}:agentcall_ref", stack_base(conversation, agent))
}

pub fn last_agentcall_ref(conversation: &str, agent: &str) -> String {
    format!("{}:last_agentcall_ref", stack_base(conversation, agent))
}

pub fn last_assistant_ref(conversation: &str, agent: &str) -> String {
    format!("{}:last_assistant_ref", stack_base(conversation, agent))
}

// ── runtime coordination ─────────────────────────────────────────────────

pub fn dedup(conversation: &str, agent: &str, branch: &str, hash: &str) -> String {
    format!("dedup:{conversation}:{agent}:{branch}:{hash}")
}

pub fn tick_fence(conversation: &str) -> String {
    format!("tick_fence:{conversation}")
}

pub fn tick_advance_fence(conversation: &str) -> String {
    format!("tick_advance:{conversation}")
}

pub fn tick_timeout_logged(conversation: &str, tick: u64) -> String {
    format!("tick_timeout_logged:{conversation}:{tick}")
}

pub fn expect_agent_result(conversation: &str, parent: &str, correlation: &str) -> String {
    format!("expect_agent_result:{conversation}:{parent}:{correlation}")
}

pub fn child_to_parent(conversation: &str, child: &str) -> String {
    format!("child_to_parent:{conversation}:{child}")
}

pub fn agent_call_correlation(conversation: &str, child: &str) -> String {
    format!("agent_call_correlation:{conversation}:{child}")
}

pub fn finished_once(conversation: &str, agent: &str, branch: &str) -> String {
    format!("finished_once:{conversation}:{agent}:{branch}")
}

pub fn agent_finished_event(conversation: &str, agent: &str, branch: &str) -> String {
    format!("agent_finished_event:{conversation}:{agent}:{branch}")
}

pub fn round_by_branch(conversation: &str, agent: &str, branch: &str) -> String {
    format!("round_by_branch:{conversation}:{agent}:{branch}")
}

pub fn response(conversation: &str) -> String {
    format!("response:{conversation}")
}

pub fn effect_log(conversation: &str) -> String {
    format!("effect_log:{conversation}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_branch_is_the_base_key() {
        assert_eq!(stack_branch("c", "a", "main"), "stack:c:a");
        assert_eq!(stack_branch("c", "a", "deadbeef"), "stack:c:a:deadbeef");
    }

    #[test]
    fn schema_matches_conventions() {
        assert_eq!(session_waiting("c", 3), "session:c:waiting:3");
        assert_eq!(tick_start_time("c", 3), "session:c:tick:3:start_time");
        assert_eq!(dedup("c", "a", "main", "h"), "dedup:c:a:main:h");
        assert_eq!(expect_agent_result("c", "p", "x"), "expect_agent_result:c:p:x");
    }
}
