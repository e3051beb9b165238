// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{error, info};

use parley_artifacts::ArtifactHeader;
use parley_runtime::helpers::append_effect_log;
use parley_runtime::{
    EffectExecutor, EngineContext, PostEffectArgs, RuntimeError, ToolContext, ToolJob,
};
use parley_stack::{keys, InteractionStack};
use parley_states::State;

/// Execute one scheduled tool call.
///
/// Asserts that the branch is still waiting on this exact call — anything
/// else is stack corruption and aborts the task.  The outcome (success,
/// error or hard timeout) always lands as a `ToolResult` with a scalar
/// reward; post-effects then run, a metrics artifact is published, and the
/// conversation is woken.  The worker never decides whether the agent is
/// done — only the handlers do.
pub async fn execute_tool(ctx: &EngineContext, job: ToolJob) -> Result<(), RuntimeError> {
    let session = ctx.session(&job.conversation_id);
    let stack = session.stack_for(&job.agent_id);

    let tool = ctx.tools.get(&job.tool_name);
    let started = std::time::Instant::now();

    let (result, reward, cache_status) = match &tool {
        None => {
            error!(tool = job.tool_name, "tool not found");
            let mut result = Map::new();
            result.insert("status".into(), json!("error"));
            result.insert(
                "message".into(),
                json!(format!("Tool '{}' not found", job.tool_name)),
            );
            (result, 0.0, "unknown".to_string())
        }
        Some(tool) => {
            let timeout = tool
                .config()
                .timeout_secs
                .unwrap_or(ctx.config.timeouts.tool_secs);
            let tool_ctx = ToolContext {
                store: ctx.store.clone(),
                conversation_id: &job.conversation_id,
                creator_id: &job.agent_id,
                branch_id: &job.branch_id,
            };
            let outcome =
                tokio::time::timeout(Duration::from_secs(timeout), tool.execute(tool_ctx, &job.parameters))
                    .await;
            match outcome {
                Ok(Ok(mut data)) => {
                    let cache = data
                        .remove("cache_status")
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    let mut result = Map::new();
                    result.insert("status".into(), json!("ok"));
                    result.insert("result".into(), Value::Object(data));
                    (result, 1.0, cache)
                }
                Ok(Err(e)) => {
                    error!(
                        tool = job.tool_name,
                        conversation_id = job.conversation_id,
                        error = %e,
                        "tool execution failed"
                    );
                    let mut result = Map::new();
                    result.insert("status".into(), json!("error"));
                    result.insert("message".into(), json!(e.to_string()));
                    (result, 0.0, "unknown".to_string())
                }
                Err(_) => {
                    error!(
                        tool = job.tool_name,
                        conversation_id = job.conversation_id,
                        timeout, "tool execution timed out"
                    );
                    let mut result = Map::new();
                    result.insert("status".into(), json!("error"));
                    result.insert("message".into(), json!("Tool execution timed out"));
                    (result, 0.0, "unknown".to_string())
                }
            }
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let waiting_matches = matches!(
        stack.current(None),
        Some(entry) if matches!(
            &entry.state,
            State::Waiting { correlation_id: Some(c), .. } if *c == job.tool_call_id
        )
    );
    if !waiting_matches {
        return Err(RuntimeError::StackCorruption(format!(
            "expected tool wait for call '{}' on {}/{}",
            job.tool_call_id, job.conversation_id, job.agent_id
        )));
    }
    stack.pop(1);

    let status = result
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    stack.push(&[State::ToolResult {
        tool_call_id: job.tool_call_id.clone(),
        tool_name: job.tool_name.clone(),
        result: result.clone(),
        arguments: Some(job.parameters.clone()),
        reward: Some(reward),
    }]);

    if let Some(tool) = &tool {
        let mut extra = Vec::new();
        for post_effect in tool.config().post_effects {
            extra.extend(ctx.post_effects.dispatch(
                &post_effect,
                &PostEffectArgs {
                    ctx,
                    conversation_id: &job.conversation_id,
                    agent_id: &job.agent_id,
                    stack: &stack,
                    parameters: &job.parameters,
                    result: &result,
                },
            ));
        }
        EffectExecutor::new(ctx).execute(extra, &job.conversation_id);
    }

    publish_tool_metrics(ctx, &job, &stack, &result, reward, &cache_status, latency_ms);

    ctx.store.del(&keys::round_by_branch(
        &job.conversation_id,
        &job.agent_id,
        &job.branch_id,
    ));
    append_effect_log(
        ctx,
        &job.conversation_id,
        json!({
            "branch_id": job.branch_id,
            "tool_name": job.tool_name,
            "parameters": job.parameters,
            "meta": {"status": status, "cache": cache_status, "latency_ms": latency_ms},
        }),
    );
    ctx.enqueue_tick(&job.conversation_id);

    info!(
        tool_name = job.tool_name,
        conversation_id = job.conversation_id,
        latency_ms,
        "tool executed"
    );
    Ok(())
}

fn publish_tool_metrics(
    ctx: &EngineContext,
    job: &ToolJob,
    stack: &InteractionStack,
    result: &Map<String, Value>,
    reward: f64,
    cache_status: &str,
    latency_ms: u64,
) {
    let mut header = ArtifactHeader::for_state(&job.conversation_id, &job.agent_id, &job.branch_id);
    header.role = "metrics".to_string();
    header.episode_id = stack.current_episode_id();
    header.model = Some(format!("tools/{}", job.tool_name));
    header.latency_ms = Some(latency_ms);
    header.reward = Some(reward);
    if let Some(team) = ctx.store.get(&keys::rollout_team(&job.conversation_id)) {
        header.meta.insert("team_id".into(), json!(team));
    }
    if let Some(variant) = ctx.store.get(&keys::rollout_variant(&job.conversation_id)) {
        header.meta.insert("variant_id".into(), json!(variant));
    }
    // Pass tool-reported spend through to the artifact header.
    header.cost_usd = result
        .get("result")
        .and_then(|r| r.get("cost_usd"))
        .and_then(Value::as_f64);

    let status = result.get("status").cloned().unwrap_or(json!("unknown"));
    let payload = json!({"status": status, "cache": cache_status});
    if let Err(e) = ctx.bus.publish(header, &payload) {
        error!(
            tool = job.tool_name,
            conversation_id = job.conversation_id,
            error = %e,
            "tool metrics publish failed"
        );
    }
}
