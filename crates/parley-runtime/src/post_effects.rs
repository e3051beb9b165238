// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Post-effects: named handlers a tool can request to run after its result
//! is on the stack (delegation hand-off, artifact export hooks, …).
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use parley_stack::InteractionStack;
use parley_states::State;

use crate::{Effect, EngineContext};

pub struct PostEffectArgs<'a> {
    pub ctx: &'a EngineContext,
    pub conversation_id: &'a str,
    pub agent_id: &'a str,
    pub stack: &'a InteractionStack,
    pub parameters: &'a Map<String, Value>,
    pub result: &'a Map<String, Value>,
}

pub trait PostEffect: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, args: &PostEffectArgs<'_>) -> anyhow::Result<Vec<Effect>>;
}

/// Registry of post-effect handlers keyed by lowercase name.  Unknown
/// names log and skip; handler failures log and yield no effects — the
/// tool worker must never die on a post-effect.
#[derive(Default)]
pub struct PostEffectRegistry {
    handlers: HashMap<String, Arc<dyn PostEffect>>,
}

impl PostEffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AgentCallPostEffect));
        registry.register(Arc::new(SaveArtifactPostEffect));
        registry.register(Arc::new(RaiseEventPostEffect));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn PostEffect>) {
        self.handlers
            .insert(handler.name().to_lowercase(), handler);
    }

    pub fn dispatch(&self, name: &str, args: &PostEffectArgs<'_>) -> Vec<Effect> {
        let Some(handler) = self.handlers.get(&name.to_lowercase()) else {
            warn!(
                post_effect = name,
                conversation_id = args.conversation_id,
                "unknown post-effect"
            );
            return Vec::new();
        };
        match handler.apply(args) {
            Ok(effects) => effects,
            Err(e) => {
                error!(
                    post_effect = name,
                    conversation_id = args.conversation_id,
                    agent_id = args.agent_id,
                    error = %e,
                    "post-effect handler failed"
                );
                Vec::new()
            }
        }
    }
}

/// Turns a delegation tool result into an `AgentCall` frame and wakes the
/// conversation so the delegation handler runs next tick.
struct AgentCallPostEffect;

impl PostEffect for AgentCallPostEffect {
    fn name(&self) -> &'static str {
        "agent_call"
    }

    fn apply(&self, args: &PostEffectArgs<'_>) -> anyhow::Result<Vec<Effect>> {
        let child = args
            .parameters
            .get("agent_id")
            .or_else(|| args.result.get("child"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("agent_call post-effect missing child agent_id"))?;
        let message = args
            .parameters
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();

        args.stack.push(&[State::AgentCall {
            agent_id: child.to_string(),
            message: message.to_string(),
        }]);

        info!(
            conversation_id = args.conversation_id,
            parent_agent = args.agent_id,
            child_agent = child,
            "agent call queued"
        );
        args.ctx.enqueue_tick(args.conversation_id);
        Ok(Vec::new())
    }
}

struct SaveArtifactPostEffect;

impl PostEffect for SaveArtifactPostEffect {
    fn name(&self) -> &'static str {
        "save_artifact"
    }

    fn apply(&self, _args: &PostEffectArgs<'_>) -> anyhow::Result<Vec<Effect>> {
        // TODO: wire to ArtifactBus::publish once a tool needs it.
        debug!("save_artifact post-effect is a no-op");
        Ok(Vec::new())
    }
}

struct RaiseEventPostEffect;

impl PostEffect for RaiseEventPostEffect {
    fn name(&self) -> &'static str {
        "raise_event"
    }

    fn apply(&self, _args: &PostEffectArgs<'_>) -> anyhow::Result<Vec<Effect>> {
        debug!("raise_event post-effect is a no-op");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::test_support::test_engine_context;
    use crate::TickQueueJob;

    use super::*;

    #[test]
    fn agent_call_pushes_frame_and_wakes_session() {
        let (ctx, mut harness) = test_engine_context();
        let stack = ctx.stack("c1", "parent");
        let registry = PostEffectRegistry::with_builtins();

        let mut params = Map::new();
        params.insert("agent_id".into(), json!("child"));
        params.insert("message".into(), json!("do X"));
        let result = Map::new();

        let effects = registry.dispatch(
            "agent_call",
            &PostEffectArgs {
                ctx: &ctx,
                conversation_id: "c1",
                agent_id: "parent",
                stack: &stack,
                parameters: &params,
                result: &result,
            },
        );
        assert!(effects.is_empty());
        assert!(matches!(
            stack.current(None).unwrap().state,
            State::AgentCall { .. }
        ));
        assert!(matches!(
            harness.receivers.ticks.try_recv().unwrap(),
            TickQueueJob::Tick(_)
        ));
    }

    #[test]
    fn missing_child_id_yields_no_effects() {
        let (ctx, _) = test_engine_context();
        let stack = ctx.stack("c1", "parent");
        let registry = PostEffectRegistry::with_builtins();
        let params = Map::new();
        let result = Map::new();
        let effects = registry.dispatch(
            "agent_call",
            &PostEffectArgs {
                ctx: &ctx,
                conversation_id: "c1",
                agent_id: "parent",
                stack: &stack,
                parameters: &params,
                result: &result,
            },
        );
        assert!(effects.is_empty());
        assert_eq!(stack.length(None), 0);
    }

    #[test]
    fn unknown_post_effect_is_skipped() {
        let (ctx, _) = test_engine_context();
        let stack = ctx.stack("c1", "a1");
        let registry = PostEffectRegistry::with_builtins();
        let params = Map::new();
        let result = Map::new();
        let effects = registry.dispatch(
            "mystery",
            &PostEffectArgs {
                ctx: &ctx,
                conversation_id: "c1",
                agent_id: "a1",
                stack: &stack,
                parameters: &params,
                result: &result,
            },
        );
        assert!(effects.is_empty());
    }
}
