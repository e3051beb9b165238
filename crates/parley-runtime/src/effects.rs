// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use parley_stack::keys;
use parley_states::{Envelope, State};

use crate::helpers::settle_wait;
use crate::EngineContext;

/// A commanded side effect produced by a handler.  Effects carry enough
/// data to execute idempotently from any worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    CallTool(CallTool),
    PushToAgent(PushToAgent),
    PushAgentResult(PushAgentResult),
    PublishSystemReply(PublishSystemReply),
}

#[derive(Debug, Clone, Serialize)]
pub struct CallTool {
    pub conversation_id: String,
    pub agent_id: String,
    pub branch_id: String,
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    pub tool_call_id: String,
    /// Serialized copy of the `ToolCall` state for worker-side replay.
    pub tool_state_env: Envelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushToAgent {
    pub conversation_id: String,
    pub target_agent_id: String,
    pub message: String,
    pub sender_agent_id: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushAgentResult {
    pub conversation_id: String,
    pub target_agent_id: String,
    pub correlation_id: String,
    pub result: Map<String, Value>,
    pub child_agent_id: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishSystemReply {
    pub conversation_id: String,
    pub message: String,
}

fn sha1_hex(blob: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(blob);
    hex::encode(hasher.finalize())
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::CallTool(_) => "CallTool",
            Effect::PushToAgent(_) => "PushToAgent",
            Effect::PushAgentResult(_) => "PushAgentResult",
            Effect::PublishSystemReply(_) => "PublishSystemReply",
        }
    }

    /// SHA-1 over a deterministic, key-sorted serialization of every
    /// field.  System replies intentionally include a nanosecond timestamp
    /// so they never deduplicate.
    pub fn dedup_key(&self) -> String {
        if let Effect::PublishSystemReply(reply) = self {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            return sha1_hex(format!("{}:{nanos}", reply.conversation_id).as_bytes());
        }
        // serde_json maps are key-ordered, so Value round-tripping yields a
        // stable blob.
        let value = serde_json::to_value(self).expect("effect serialization is infallible");
        sha1_hex(value.to_string().as_bytes())
    }

    /// Execute the effect against the engine.  `CallTool` is routed by the
    /// effect executor instead and must not land here.
    pub fn execute(&self, ctx: &EngineContext) -> anyhow::Result<()> {
        match self {
            Effect::CallTool(_) => {
                anyhow::bail!("CallTool is dispatched by the effect executor")
            }
            Effect::PushToAgent(effect) => effect.execute(ctx),
            Effect::PushAgentResult(effect) => effect.execute(ctx),
            Effect::PublishSystemReply(effect) => effect.execute(ctx),
        }
        Ok(())
    }
}

impl PushToAgent {
    /// Deliver a delegation message: seed the target's stack, propagate the
    /// sender's episode id so metrics group together, record the
    /// child→parent linkage, and wake the conversation.
    pub fn execute(&self, ctx: &EngineContext) {
        let ttl = ctx.config.stack.key_ttl_secs;
        let session = ctx.session(&self.conversation_id);
        let stack = session.stack_for(&self.target_agent_id);
        let branch = stack.current_branch();

        let sender_episode = ctx.store.get(&keys::episode(
            &self.conversation_id,
            &self.sender_agent_id,
            &branch,
        ));
        if let Some(episode) = sender_episode {
            ctx.store.set_ex(
                &keys::episode(&self.conversation_id, &self.target_agent_id, &branch),
                &episode,
                ttl,
            );
        }

        stack.push(&[State::user(&self.message)]);

        ctx.store.set_ex(
            &keys::child_to_parent(&self.conversation_id, &self.target_agent_id),
            &self.sender_agent_id,
            ttl,
        );
        ctx.store.set_ex(
            &keys::agent_call_correlation(&self.conversation_id, &self.target_agent_id),
            &self.correlation_id,
            ttl,
        );

        ctx.enqueue_tick(&self.conversation_id);
        info!(
            conversation_id = self.conversation_id,
            target_agent_id = self.target_agent_id,
            sender_agent_id = self.sender_agent_id,
            "pushed message to agent"
        );
    }
}

impl PushAgentResult {
    /// Deliver a child's answer to the waiting parent.  If the parent-side
    /// guard key has lapsed the result is late: log and drop.
    pub fn execute(&self, ctx: &EngineContext) {
        let guard = keys::expect_agent_result(
            &self.conversation_id,
            &self.target_agent_id,
            &self.correlation_id,
        );
        if !ctx.store.exists(&guard) {
            warn!(
                conversation_id = self.conversation_id,
                target_agent_id = self.target_agent_id,
                child_agent_id = self.child_agent_id,
                correlation_id = self.correlation_id,
                "late_agent_result"
            );
            return;
        }

        let stack = ctx.stack(&self.conversation_id, &self.target_agent_id);
        settle_wait(&stack, &self.correlation_id);
        ctx.store.del(&guard);

        let duplicate = stack.iter_last_n(50).iter().any(|entry| {
            matches!(
                &entry.state,
                State::AgentResult { correlation_id, .. } if *correlation_id == self.correlation_id
            )
        });

        if !duplicate {
            let mut payload = self.result.clone();
            if let Some(score) = self.score {
                payload.insert("score".to_string(), score.into());
            }
            stack.push(&[State::AgentResult {
                correlation_id: self.correlation_id.clone(),
                result: payload,
                score: self.score,
            }]);
        }

        ctx.enqueue_tick(&self.conversation_id);

        ctx.store
            .del(&keys::child_to_parent(&self.conversation_id, &self.child_agent_id));
        ctx.store.del(&keys::agent_call_correlation(
            &self.conversation_id,
            &self.child_agent_id,
        ));

        info!(
            conversation_id = self.conversation_id,
            target_agent_id = self.target_agent_id,
            child_agent_id = self.child_agent_id,
            score = ?self.score,
            "pushed agent result to parent"
        );
    }
}

impl PublishSystemReply {
    /// Latest system-level answer for the conversation, readable by any
    /// waiting client for an hour.
    pub fn execute(&self, ctx: &EngineContext) {
        ctx.store
            .set_ex(&keys::response(&self.conversation_id), &self.message, 3_600);
        info!(
            conversation_id = self.conversation_id,
            "system reply published"
        );
    }
}
