// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Map};
use tracing::{debug, error, info};

use parley_states::State;

use crate::helpers::{append_effect_log, settle_wait};
use crate::{CallTool, Effect, EngineContext, ToolJob};

/// Applies the dedup policy and routes effects: admitted tool calls go to
/// the `tools` queue, everything else executes in place.  Failures are
/// logged, never propagated — a broken effect must not abort its tick.
pub struct EffectExecutor<'a> {
    ctx: &'a EngineContext,
}

impl<'a> EffectExecutor<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, effects: Vec<Effect>, conversation_id: &str) {
        for effect in effects {
            match effect {
                Effect::CallTool(call) => {
                    if self.ctx.dedup.should_execute(&call) {
                        self.enqueue_tool(call, conversation_id);
                    } else {
                        self.skip_duplicate(call, conversation_id);
                    }
                }
                other => {
                    let name = other.name();
                    match other.execute(self.ctx) {
                        Ok(()) => {
                            info!(effect = name, conversation_id, "effect executed");
                            self.ctx
                                .metrics
                                .emit("effect_executed", 1.0, &[("effect", name)]);
                        }
                        Err(e) => {
                            error!(
                                effect = name,
                                conversation_id,
                                error = %e,
                                "failed to execute effect"
                            );
                        }
                    }
                }
            }
        }
    }

    fn enqueue_tool(&self, call: CallTool, conversation_id: &str) {
        self.ctx.queues.enqueue_tool(ToolJob {
            conversation_id: call.conversation_id,
            agent_id: call.agent_id,
            tool_name: call.tool_name.clone(),
            parameters: call.parameters,
            tool_call_id: call.tool_call_id,
            branch_id: call.branch_id,
            tool_state_env: call.tool_state_env,
        });
        info!(
            effect = "CallTool",
            tool = call.tool_name,
            conversation_id,
            "effect executed (tool scheduled)"
        );
        self.ctx
            .metrics
            .emit("effect_executed", 1.0, &[("effect", "CallTool")]);
    }

    /// Convert a rejected tool call into a synthetic skipped result so the
    /// waiting branch keeps moving.
    fn skip_duplicate(&self, call: CallTool, conversation_id: &str) {
        append_effect_log(
            self.ctx,
            conversation_id,
            json!({
                "branch_id": call.branch_id,
                "tool_name": call.tool_name,
                "parameters": call.parameters,
                "meta": {"status": "skipped", "reason": "dedup"},
            }),
        );

        let stack = self.ctx.stack(conversation_id, &call.agent_id);
        settle_wait(&stack, &call.tool_call_id);

        let mut result = Map::new();
        result.insert("status".into(), json!("skipped"));
        result.insert(
            "message".into(),
            json!("Duplicate call skipped by dedup policy"),
        );
        stack.push(&[State::ToolResult {
            tool_call_id: call.tool_call_id,
            tool_name: call.tool_name.clone(),
            result,
            arguments: None,
            reward: None,
        }]);

        self.ctx.enqueue_tick(conversation_id);

        debug!(
            tool = call.tool_name,
            conversation_id, "skipped duplicate tool call"
        );
        self.ctx.metrics.emit(
            "effect_skipped",
            1.0,
            &[("effect", "CallTool"), ("reason", "dedup")],
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_stack::keys;
    use parley_states::{encode, WaitKind};
    use serde_json::Value;

    use crate::test_support::test_engine_context;
    use crate::{
        Effect, PublishSystemReply, StrictDedupPolicy, TickQueueJob,
    };

    use super::*;

    fn call_tool_effect(conversation: &str) -> Effect {
        let mut params = Map::new();
        params.insert("x".into(), json!(1));
        let state = State::ToolCall {
            id: "h1".into(),
            function_name: "echo".into(),
            arguments: params.clone(),
        };
        Effect::CallTool(CallTool {
            conversation_id: conversation.into(),
            agent_id: "a1".into(),
            branch_id: "main".into(),
            tool_name: "echo".into(),
            parameters: params,
            tool_call_id: "h1".into(),
            tool_state_env: encode(&state, 1.0),
        })
    }

    #[tokio::test]
    async fn admitted_tool_call_lands_on_tools_queue() {
        let (ctx, mut harness) = test_engine_context();
        EffectExecutor::new(&ctx).execute(vec![call_tool_effect("c1")], "c1");
        let job = harness.receivers.tools.try_recv().unwrap();
        assert_eq!(job.tool_name, "echo");
        assert_eq!(harness.metrics.count("effect_executed"), 1);
    }

    #[tokio::test]
    async fn rejected_tool_call_becomes_skipped_result() {
        let (mut ctx, mut harness) = test_engine_context();
        ctx.dedup = Arc::new(StrictDedupPolicy::new(
            ctx.store.clone(),
            ctx.tools.clone(),
            ctx.metrics.clone(),
            600,
        ));

        // stack is waiting on the call about to be rejected
        let stack = ctx.stack("c1", "a1");
        stack.push(&[State::Waiting {
            kind: WaitKind::Tool,
            deadline: f64::MAX,
            correlation_id: Some("h1".into()),
        }]);

        let executor = EffectExecutor::new(&ctx);
        executor.execute(vec![call_tool_effect("c1")], "c1");
        executor.execute(vec![call_tool_effect("c1")], "c1");

        // first admitted, second skipped
        assert!(harness.receivers.tools.try_recv().is_ok());
        assert!(harness.receivers.tools.try_recv().is_err());

        let top = stack.current(None).unwrap().state;
        match top {
            State::ToolResult { result, .. } => {
                assert_eq!(result["status"], json!("skipped"));
                assert_eq!(
                    result["message"],
                    json!("Duplicate call skipped by dedup policy")
                );
            }
            other => panic!("expected skipped tool result, got {other:?}"),
        }

        assert_eq!(harness.metrics.count("effect_skipped"), 1);
        assert!(matches!(
            harness.receivers.ticks.try_recv().unwrap(),
            TickQueueJob::Tick(_)
        ));

        let log = ctx.store.lrange(&keys::effect_log("c1"), 0, -1);
        assert_eq!(log.len(), 1);
        let entry: Value = serde_json::from_str(&log[0]).unwrap();
        assert_eq!(entry["meta"]["status"], json!("skipped"));
    }

    #[tokio::test]
    async fn generic_effect_executes_and_counts() {
        let (ctx, harness) = test_engine_context();
        EffectExecutor::new(&ctx).execute(
            vec![Effect::PublishSystemReply(PublishSystemReply {
                conversation_id: "c1".into(),
                message: "hi".into(),
            })],
            "c1",
        );
        assert_eq!(
            ctx.store.get(&keys::response("c1")).as_deref(),
            Some("hi")
        );
        assert_eq!(harness.metrics.count("effect_executed"), 1);
    }
}
