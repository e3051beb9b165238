// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tracing::info;

use parley_stack::keys;
use parley_store::Store;

use crate::helpers::hash_tool_call;
use crate::{CallTool, Metrics, ToolRegistry};

/// Decides whether a `CallTool` effect proceeds to the tools queue.
pub trait DedupPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_execute(&self, effect: &CallTool) -> bool;
}

/// Always admit.
#[derive(Debug, Default)]
pub struct NoDedupPolicy;

impl DedupPolicy for NoDedupPolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn should_execute(&self, _effect: &CallTool) -> bool {
        true
    }
}

fn dedup_key(effect: &CallTool) -> String {
    let stable_hash = hash_tool_call(&effect.tool_name, &effect.parameters);
    keys::dedup(
        &effect.conversation_id,
        &effect.agent_id,
        &effect.branch_id,
        &stable_hash,
    )
}

fn duplicate_tags<'a>(effect: &'a CallTool, policy: &'a str, action: &'a str) -> [(&'a str, &'a str); 6] {
    [
        ("conversation_id", effect.conversation_id.as_str()),
        ("agent_id", effect.agent_id.as_str()),
        ("tool", effect.tool_name.as_str()),
        ("branch", effect.branch_id.as_str()),
        ("policy", policy),
        ("action", action),
    ]
}

/// Admit everything, but record repeats so they can be penalised offline.
pub struct PenaltyDedupPolicy {
    store: Arc<dyn Store>,
    tools: Arc<ToolRegistry>,
    metrics: Arc<dyn Metrics>,
    default_ttl_secs: u64,
}

impl PenaltyDedupPolicy {
    pub fn new(
        store: Arc<dyn Store>,
        tools: Arc<ToolRegistry>,
        metrics: Arc<dyn Metrics>,
        default_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            tools,
            metrics,
            default_ttl_secs,
        }
    }
}

impl DedupPolicy for PenaltyDedupPolicy {
    fn name(&self) -> &'static str {
        "penalty"
    }

    fn should_execute(&self, effect: &CallTool) -> bool {
        let ttl = self
            .tools
            .get(&effect.tool_name)
            .and_then(|t| t.config().dedup_ttl_secs)
            .unwrap_or(self.default_ttl_secs);

        let added = self.store.set_nx_ex(&dedup_key(effect), "1", ttl);
        if !added {
            self.metrics.emit(
                "duplicate_tool_call",
                1.0,
                &duplicate_tags(effect, self.name(), "allowed"),
            );
            info!(tool = effect.tool_name, "duplicate tool call (penalty, allowed)");
        }
        true
    }
}

/// Reject duplicates within the TTL window unless the tool declares itself
/// side-effect free.
pub struct StrictDedupPolicy {
    store: Arc<dyn Store>,
    tools: Arc<ToolRegistry>,
    metrics: Arc<dyn Metrics>,
    default_ttl_secs: u64,
}

impl StrictDedupPolicy {
    pub fn new(
        store: Arc<dyn Store>,
        tools: Arc<ToolRegistry>,
        metrics: Arc<dyn Metrics>,
        default_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            tools,
            metrics,
            default_ttl_secs,
        }
    }
}

impl DedupPolicy for StrictDedupPolicy {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn should_execute(&self, effect: &CallTool) -> bool {
        let config = self.tools.get(&effect.tool_name).map(|t| t.config());
        let side_effect_free = config.as_ref().is_some_and(|c| c.side_effect_free);
        let ttl = config
            .and_then(|c| c.dedup_ttl_secs)
            .unwrap_or(self.default_ttl_secs);

        if self.store.set_nx_ex(&dedup_key(effect), "1", ttl) {
            return true;
        }

        let action = if side_effect_free { "allowed" } else { "blocked" };
        self.metrics.emit(
            "duplicate_tool_call",
            1.0,
            &duplicate_tags(effect, self.name(), action),
        );
        info!(tool = effect.tool_name, action, "duplicate tool call");
        side_effect_free
    }
}
