// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Handlers mapping the top-of-stack state to effects.
//!
//! The dispatch match is the handler table: one arm per state kind, each
//! arm a function with the same shape.  Handlers push states and return
//! effects; they never execute side effects themselves.
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use parley_stack::{keys, InteractionStack, StackEntry};
use parley_states::{State, WaitKind};

use crate::helpers::{
    mark_finished, materialise_response, self_reflection_prompt, settle_wait,
    tool_reflection_prompt,
};
use crate::render::render_transcript;
use crate::{
    Agent, Ask, DelegateJob, Effect, EngineContext, PublishSystemReply, PushToAgent, DELEGATE_TOOL,
};

/// Dispatch the top entry to its handler.  Every state kind is known;
/// message-like tops that simply carry no pending work fall through to a
/// no-op.
pub async fn dispatch(
    ctx: &EngineContext,
    entry: &StackEntry,
    stack: &InteractionStack,
    agent: &Arc<dyn Agent>,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    match &entry.state {
        State::UserMessage { .. } | State::UserResponse { .. } => {
            handle_user_turn(ctx, stack, agent, conversation_id, agent_id).await
        }
        State::ToolResult { .. } => {
            handle_tool_result(ctx, entry, stack, agent, conversation_id, agent_id).await
        }
        State::Waiting { .. } => handle_waiting(ctx, entry, stack, conversation_id, agent_id),
        State::AgentCall { .. } => handle_agent_call(ctx, entry, stack, conversation_id, agent_id),
        State::AgentResult { .. } => {
            handle_agent_result(ctx, entry, stack, agent, conversation_id, agent_id).await
        }
        State::Finished => handle_finished(ctx, stack, agent, conversation_id, agent_id),
        State::UserInputRequest { .. } => Ok(Vec::new()),
        // Nothing is pending on these; the next push reactivates the branch.
        State::AssistantMessage { .. } | State::ToolCall { .. } => Ok(Vec::new()),
    }
}

async fn handle_user_turn(
    ctx: &EngineContext,
    stack: &InteractionStack,
    agent: &Arc<dyn Agent>,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    let ask = Ask {
        history: render_transcript(stack, ctx.config.tick.history_window, &[]),
        conversation_id: conversation_id.to_string(),
    };
    let response = agent.run(ask).await?;
    Ok(materialise_response(
        ctx,
        stack,
        response,
        conversation_id,
        agent_id,
    ))
}

async fn handle_tool_result(
    ctx: &EngineContext,
    entry: &StackEntry,
    stack: &InteractionStack,
    agent: &Arc<dyn Agent>,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    let State::ToolResult {
        tool_name,
        arguments,
        result,
        ..
    } = &entry.state
    else {
        unreachable!("dispatched on ToolResult");
    };

    // Delegation results are produced by the bridge, not the agent loop.
    if tool_name == DELEGATE_TOOL {
        return Ok(Vec::new());
    }

    let ask = Ask {
        history: render_transcript(stack, ctx.config.tick.history_window, &[]),
        conversation_id: conversation_id.to_string(),
    };
    let response = agent.run(ask).await?;
    let effects = materialise_response(ctx, stack, response, conversation_id, agent_id);

    if let Some(tool) = ctx.tools.get(tool_name) {
        if tool.config().reflect {
            stack.push(&[State::user_with_meta(
                tool_reflection_prompt(tool_name, arguments.as_ref(), result),
                format!("reflection:{tool_name}"),
            )]);
        }
    }
    Ok(effects)
}

fn handle_waiting(
    ctx: &EngineContext,
    entry: &StackEntry,
    stack: &InteractionStack,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    let State::Waiting {
        kind,
        deadline,
        correlation_id,
    } = &entry.state
    else {
        unreachable!("dispatched on Waiting");
    };

    let now = ctx.clock.now();
    if !entry.state.is_expired(now) {
        return Ok(Vec::new());
    }

    if *kind == WaitKind::Agent {
        if let Some(correlation) = correlation_id {
            // Grace window: the parent-side guard outlives the deadline by
            // a few seconds, so a result already in flight still lands.
            let guard = keys::expect_agent_result(conversation_id, agent_id, correlation);
            if ctx.store.exists(&guard) {
                debug!(
                    conversation_id,
                    agent_id, correlation, "waiting grace window, guard still live"
                );
                return Ok(Vec::new());
            }
        }
    }

    if *kind == WaitKind::Tool {
        if let Some(correlation) = correlation_id {
            // Allow a future retry of the same call to pass the dedup probe.
            ctx.store.del(&keys::dedup(
                conversation_id,
                agent_id,
                &stack.current_branch(),
                correlation,
            ));
        }
    }

    warn!(
        conversation_id,
        agent_id,
        kind = ?kind,
        correlation_id = ?correlation_id,
        deadline,
        "timeout while waiting"
    );

    let timeout_result = if *kind == WaitKind::Agent {
        let mut result = Map::new();
        result.insert("status".into(), json!("timeout"));
        result.insert("message".into(), json!("Agent response timeout"));
        State::AgentResult {
            correlation_id: correlation_id.clone().unwrap_or_default(),
            result,
            score: None,
        }
    } else {
        let tool_name = correlation_id
            .as_ref()
            .and_then(|correlation| {
                stack.iter_last_n(50).into_iter().find_map(|prev| {
                    match prev.state {
                        State::ToolCall {
                            id, function_name, ..
                        } if id == *correlation => Some(function_name),
                        _ => None,
                    }
                })
            })
            .unwrap_or_else(|| "unknown".to_string());
        let mut result = Map::new();
        result.insert("status".into(), json!("timeout"));
        result.insert(
            "message".into(),
            json!("Tool call exceeded the time-out limit"),
        );
        State::ToolResult {
            tool_call_id: correlation_id.clone().unwrap_or_else(|| "unknown".into()),
            tool_name,
            result,
            arguments: None,
            reward: None,
        }
    };

    stack.pop(1);
    stack.push(&[timeout_result]);

    if stack.parent_agent_id().is_none() {
        mark_finished(ctx, stack);
    }

    // Empty reply wakes any client blocked on the response key.
    Ok(vec![Effect::PublishSystemReply(PublishSystemReply {
        conversation_id: conversation_id.to_string(),
        message: String::new(),
    })])
}

fn handle_agent_call(
    ctx: &EngineContext,
    entry: &StackEntry,
    stack: &InteractionStack,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    let State::AgentCall {
        agent_id: target_agent_id,
        message,
    } = &entry.state
    else {
        unreachable!("dispatched on AgentCall");
    };

    stack.push(&[State::assistant("Hang on, checking that for you…")]);

    let ttl = ctx.config.stack.key_ttl_secs;
    let correlation_id = uuid::Uuid::new_v4().simple().to_string();
    let now = ctx.clock.now();
    let deadline = now
        + ctx
            .config
            .timeouts
            .tool_secs
            .max(ctx.config.timeouts.min_agent_response_secs) as f64;

    ctx.store.set_ex(
        &keys::child_to_parent(conversation_id, target_agent_id),
        agent_id,
        ttl,
    );
    ctx.store.set_ex(
        &keys::agent_call_correlation(conversation_id, target_agent_id),
        &correlation_id,
        ttl,
    );

    stack.push(&[State::Waiting {
        kind: WaitKind::Agent,
        deadline,
        correlation_id: Some(correlation_id.clone()),
    }]);

    file_pending_agentcall_ref(ctx, conversation_id, agent_id, &correlation_id);
    arm_result_guard(ctx, conversation_id, agent_id, &correlation_id, deadline, now);

    Ok(vec![Effect::PushToAgent(PushToAgent {
        conversation_id: conversation_id.to_string(),
        target_agent_id: target_agent_id.clone(),
        message: message.clone(),
        sender_agent_id: agent_id.to_string(),
        correlation_id,
    })])
}

/// Move the just-pushed `AgentCall` artifact ref under its correlation id
/// so the eventual `AgentResult` chains to it.
fn file_pending_agentcall_ref(
    ctx: &EngineContext,
    conversation_id: &str,
    agent_id: &str,
    correlation_id: &str,
) {
    let pending = keys::last_agentcall_ref(conversation_id, agent_id);
    if let Some(parent_ref) = ctx.store.get(&pending) {
        ctx.store.hset(
            &keys::agentcall_ref(conversation_id, agent_id),
            correlation_id,
            &parent_ref,
        );
        ctx.store.del(&pending);
    }
}

/// Guard key asserting the parent still expects a delegate result.  Its
/// absence at delivery time marks the result as late.
fn arm_result_guard(
    ctx: &EngineContext,
    conversation_id: &str,
    agent_id: &str,
    correlation_id: &str,
    deadline: f64,
    now: f64,
) {
    let guard = keys::expect_agent_result(conversation_id, agent_id, correlation_id);
    let ttl = (deadline - now + 5.0).max(1.0) as u64;
    ctx.store.set_ex(&guard, "1", ttl);
}

async fn handle_agent_result(
    ctx: &EngineContext,
    entry: &StackEntry,
    stack: &InteractionStack,
    agent: &Arc<dyn Agent>,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    let State::AgentResult {
        correlation_id,
        result,
        ..
    } = &entry.state
    else {
        unreachable!("dispatched on AgentResult");
    };

    settle_wait(stack, correlation_id);

    let content = result
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    if !content.is_empty() {
        stack.push(&[State::assistant(&content)]);
        mark_finished(ctx, stack);
        return Ok(vec![Effect::PublishSystemReply(PublishSystemReply {
            conversation_id: conversation_id.to_string(),
            message: content,
        })]);
    }

    // Empty child result: the parent synthesises its own answer without
    // seeing the delegate frames.
    let ask = Ask {
        history: render_transcript(
            stack,
            ctx.config.tick.history_window,
            &["agent_result"],
        ),
        conversation_id: conversation_id.to_string(),
    };
    let response = agent.run(ask).await?;
    let effects = materialise_response(ctx, stack, response, conversation_id, agent_id);
    mark_finished(ctx, stack);
    Ok(effects)
}

fn handle_finished(
    ctx: &EngineContext,
    stack: &InteractionStack,
    agent: &Arc<dyn Agent>,
    conversation_id: &str,
    agent_id: &str,
) -> anyhow::Result<Vec<Effect>> {
    let branch = stack.current_branch();
    let once = keys::finished_once(conversation_id, agent_id, &branch);
    if !ctx
        .store
        .set_nx_ex(&once, "1", ctx.config.stack.key_ttl_secs)
    {
        return Ok(Vec::new());
    }

    let parent_agent_id = stack.parent_agent_id();
    let correlation_id = parent_agent_id
        .as_ref()
        .and_then(|_| stack.correlation_id());

    if let (Some(parent), Some(correlation)) = (&parent_agent_id, &correlation_id) {
        ctx.queues.enqueue_delegate(DelegateJob {
            conversation_id: conversation_id.to_string(),
            parent_agent_id: parent.clone(),
            child_agent_id: agent_id.to_string(),
            correlation_id: correlation.clone(),
            text: stack.last_assistant_message().unwrap_or_default(),
        });
    }

    schedule_auto_evaluation(
        ctx,
        stack,
        conversation_id,
        agent_id,
        parent_agent_id.as_deref(),
        correlation_id.as_deref(),
    );

    let behavior = agent.behavior();

    if behavior.enable_self_reflection {
        let reflections = stack
            .iter_last_n(stack.length(None))
            .iter()
            .filter(|e| {
                matches!(
                    &e.state,
                    State::AssistantMessage { meta: Some(m), .. } if m.starts_with("reflection")
                )
            })
            .count();
        if reflections < ctx.config.reflection.max_reflections {
            let last = stack.last_assistant_message().unwrap_or_default();
            stack.push(&[State::user_with_meta(
                self_reflection_prompt(&last),
                "reflection",
            )]);
            return Ok(Vec::new());
        }
    }

    if let Some(critic) = behavior.reflection_agent_id {
        let last = stack
            .last_assistant_message()
            .unwrap_or_else(|| "No response".to_string());
        let critique = format!("Critique the following response: {last}");
        let correlation_id = uuid::Uuid::new_v4().simple().to_string();
        let now = ctx.clock.now();
        let deadline = now + ctx.config.timeouts.tool_secs as f64;

        stack.push(&[State::AgentCall {
            agent_id: critic.clone(),
            message: critique.clone(),
        }]);
        stack.push(&[State::Waiting {
            kind: WaitKind::Agent,
            deadline,
            correlation_id: Some(correlation_id.clone()),
        }]);
        file_pending_agentcall_ref(ctx, conversation_id, agent_id, &correlation_id);
        arm_result_guard(ctx, conversation_id, agent_id, &correlation_id, deadline, now);

        return Ok(vec![Effect::PushToAgent(PushToAgent {
            conversation_id: conversation_id.to_string(),
            target_agent_id: critic,
            message: critique,
            sender_agent_id: agent_id.to_string(),
            correlation_id,
        })]);
    }

    Ok(Vec::new())
}

fn schedule_auto_evaluation(
    ctx: &EngineContext,
    stack: &InteractionStack,
    conversation_id: &str,
    agent_id: &str,
    parent_agent_id: Option<&str>,
    correlation_id: Option<&str>,
) {
    let Some(judge_id) = &ctx.config.eval.judge_id else {
        return;
    };

    let Some(target_ref) = ctx
        .store
        .get(&keys::last_assistant_ref(conversation_id, agent_id))
    else {
        error!(
            conversation_id,
            agent_id, "auto evaluation skipped, no assistant artifact"
        );
        return;
    };

    let traj = render_transcript(stack, 50, &[]);
    let mut payload = Map::new();
    payload.insert("traj".into(), json!(traj));
    payload.insert("parent_agent_id".into(), json!(parent_agent_id));
    payload.insert("correlation_id".into(), json!(correlation_id));
    payload.insert("child_agent_id".into(), json!(agent_id));

    // The judge worker patches the real version once it runs.
    if let Err(e) = ctx
        .bus
        .create_evaluation_for(&target_ref, judge_id, "0", payload)
    {
        error!(
            conversation_id,
            agent_id,
            error = %e,
            "failed to enqueue evaluation"
        );
    }
}
