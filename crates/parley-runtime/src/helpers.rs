// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared runtime helpers: finishing, tool hashing, response
//! materialisation and the effect log.
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use tracing::error;

use parley_artifacts::ArtifactHeader;
use parley_stack::{keys, InteractionStack};
use parley_states::{encode_with_threshold, State, WaitKind};

use crate::{AgentResponse, CallTool, Effect, EngineContext, PublishSystemReply};

/// Stable hash of a tool invocation: SHA-1 over the key-sorted JSON of
/// `(name, params)`.  Doubles as the tool-call id, the waiting-frame
/// correlation id and the dedup-key suffix.
pub fn hash_tool_call(name: &str, params: &Map<String, Value>) -> String {
    let blob = json!({"name": name, "params": params}).to_string();
    let mut hasher = Sha1::new();
    hasher.update(blob.as_bytes());
    hex::encode(hasher.finalize())
}

/// Pop the top `Waiting` frame iff it carries the given correlation id.
pub fn settle_wait(stack: &InteractionStack, correlation_id: &str) {
    if let Some(entry) = stack.current(None) {
        if matches!(
            &entry.state,
            State::Waiting { correlation_id: Some(c), .. } if c == correlation_id
        ) {
            stack.pop(1);
        }
    }
}

/// Emit the once-per-(agent, branch) `agent_finished` event artifact and
/// metric.  Idempotent via a set-if-absent guard.
pub fn publish_agent_finished(
    ctx: &EngineContext,
    conversation_id: &str,
    agent_id: &str,
    branch_id: &str,
) {
    let guard = keys::agent_finished_event(conversation_id, agent_id, branch_id);
    if !ctx
        .store
        .set_nx_ex(&guard, "1", ctx.config.stack.key_ttl_secs)
    {
        return;
    }

    let mut header = ArtifactHeader::for_state(conversation_id, agent_id, branch_id);
    header.role = "event".to_string();
    header.meta.insert("event".into(), json!("agent_finished"));
    if let Err(e) = ctx.bus.publish(header, &json!({})) {
        error!(
            conversation_id,
            agent_id,
            error = %e,
            "failed to publish agent_finished"
        );
    }
    ctx.metrics.emit(
        "agent_finished",
        1.0,
        &[
            ("conversation_id", conversation_id),
            ("agent_id", agent_id),
            ("branch", branch_id),
        ],
    );
}

/// Terminate the current branch unless something still blocks it.
///
/// The root agent of an interactive CLI conversation is kept open; a
/// branch already terminated stays untouched; and a branch with any
/// unexpired `Waiting` frame is not finished out from under its wait.
pub fn mark_finished(ctx: &EngineContext, stack: &InteractionStack) {
    let conversation_id = stack.conversation_id();
    let is_root = stack.parent_agent_id().is_none();

    if is_root
        && ctx
            .store
            .exists(&keys::conversation_is_cli(conversation_id))
    {
        return;
    }

    if matches!(stack.current(None), Some(e) if e.state.is_terminal()) {
        return;
    }

    let now = ctx.clock.now();
    let depth = stack.length(None);
    if stack
        .iter_last_n(depth)
        .iter()
        .any(|e| matches!(e.state, State::Waiting { .. }) && !e.state.is_expired(now))
    {
        return;
    }

    stack.push(&[State::Finished]);
    ctx.store.sadd(
        &keys::session_finished(conversation_id),
        stack.agent_id(),
    );
    publish_agent_finished(
        ctx,
        conversation_id,
        stack.agent_id(),
        &stack.current_branch(),
    );
}

/// Append a structured entry to the conversation's capped effect log.
pub fn append_effect_log(ctx: &EngineContext, conversation_id: &str, entry: Value) {
    let key = keys::effect_log(conversation_id);
    ctx.store.rpush(&key, &[entry.to_string()]);
    ctx.store.ltrim(&key, -1_000, -1);
    ctx.store.expire(&key, ctx.config.stack.key_ttl_secs);
}

fn rollout_meta(ctx: &EngineContext, conversation_id: &str, meta: Option<String>) -> Option<String> {
    if meta.is_some() {
        return meta;
    }
    let team = ctx.store.get(&keys::rollout_team(conversation_id));
    let variant = ctx.store.get(&keys::rollout_variant(conversation_id));
    match (team, variant) {
        (None, None) => None,
        (team, variant) => Some(format!(
            "rollout:{}/{}",
            team.unwrap_or_default(),
            variant.unwrap_or_default()
        )),
    }
}

/// Turn an agent's response into stack pushes plus effects.
///
/// A `Reply` lands as an assistant message; the branch is finished (root
/// agents of interactive sessions excepted) and, for root agents, the
/// reply is published as the conversation's answer.  A `FunctionCall`
/// lands as a `ToolCall` + tool `Waiting` pair and commands a `CallTool`
/// effect — unless the branch is already waiting: the identical call is
/// swallowed, a different one is refused with a system nudge.
pub fn materialise_response(
    ctx: &EngineContext,
    stack: &InteractionStack,
    response: Option<AgentResponse>,
    conversation_id: &str,
    agent_id: &str,
) -> Vec<Effect> {
    let Some(response) = response else {
        error!(agent_id, "agent returned no response");
        return Vec::new();
    };

    match response {
        AgentResponse::Reply { message } => {
            let message = message.trim().to_string();
            let meta = match stack.current(None) {
                Some(entry) => match entry.state {
                    State::UserMessage { meta, .. } => meta,
                    _ => None,
                },
                None => None,
            };
            let meta = rollout_meta(ctx, conversation_id, meta);
            stack.push(&[State::AssistantMessage {
                content: Some(message.clone()),
                tool_calls: None,
                meta,
            }]);

            let is_child = stack.parent_agent_id().is_some();
            mark_finished(ctx, stack);

            if is_child {
                Vec::new()
            } else {
                vec![Effect::PublishSystemReply(PublishSystemReply {
                    conversation_id: conversation_id.to_string(),
                    message,
                })]
            }
        }

        AgentResponse::FunctionCall {
            function_name,
            arguments,
        } => {
            let tool_hash = hash_tool_call(&function_name, &arguments);
            let branch_id = stack.current_branch();

            if let Some(top) = stack.current(None) {
                if let State::Waiting { correlation_id, .. } = &top.state {
                    if correlation_id.as_deref() == Some(tool_hash.as_str()) {
                        return Vec::new();
                    }
                    return vec![Effect::PublishSystemReply(PublishSystemReply {
                        conversation_id: conversation_id.to_string(),
                        message: "Let's finish the current action before starting another."
                            .to_string(),
                    })];
                }
            }

            let now = ctx.clock.now();
            let tool_state = State::ToolCall {
                id: tool_hash.clone(),
                function_name: function_name.clone(),
                arguments: arguments.clone(),
            };
            let waiting = State::Waiting {
                kind: WaitKind::Tool,
                deadline: now + ctx.config.timeouts.tool_secs as f64,
                correlation_id: Some(tool_hash.clone()),
            };
            let tool_state_env =
                encode_with_threshold(&tool_state, now, ctx.config.stack.gzip_threshold);
            stack.push(&[tool_state, waiting]);

            vec![Effect::CallTool(CallTool {
                conversation_id: conversation_id.to_string(),
                agent_id: agent_id.to_string(),
                branch_id,
                tool_name: function_name,
                parameters: arguments,
                tool_call_id: tool_hash,
                tool_state_env,
            })]
        }
    }
}

/// Prompt pushed after a `reflect = true` tool result.
pub fn tool_reflection_prompt(
    tool_name: &str,
    arguments: Option<&Map<String, Value>>,
    result: &Map<String, Value>,
) -> String {
    format!(
        "Review the outcome of the `{tool_name}` call.\n\
         Arguments: {}\n\
         Result: {}\n\
         Briefly state whether the result is satisfactory and what, if \
         anything, you would do differently.",
        arguments
            .map(|a| Value::Object(a.clone()).to_string())
            .unwrap_or_else(|| "{}".to_string()),
        Value::Object(result.clone()),
    )
}

/// Prompt pushed when an agent critiques its own final answer.
pub fn self_reflection_prompt(response: &str) -> String {
    format!(
        "Reflect on your previous response:\n\n{response}\n\n\
         If it fully answers the request, restate it. Otherwise produce an \
         improved answer."
    )
}
