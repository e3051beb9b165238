// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tracing::error;

use parley_stack::InteractionStack;

use crate::{handlers, Agent, Effect, EngineContext};

/// One agent's view of the state machine for a single tick.
///
/// `step` reads the top of the current branch, dispatches it, and returns
/// the commanded effects.  Handler failures are logged and converted into
/// "no effects" so one broken agent cannot take the tick down.
pub struct AgentRuntime<'a> {
    ctx: &'a EngineContext,
    agent: Arc<dyn Agent>,
    stack: &'a InteractionStack,
}

impl<'a> AgentRuntime<'a> {
    pub fn new(ctx: &'a EngineContext, agent: Arc<dyn Agent>, stack: &'a InteractionStack) -> Self {
        Self { ctx, agent, stack }
    }

    pub async fn step(&self) -> Vec<Effect> {
        let Some(entry) = self.stack.current(None) else {
            return Vec::new();
        };

        match handlers::dispatch(
            self.ctx,
            &entry,
            self.stack,
            &self.agent,
            self.stack.conversation_id(),
            self.stack.agent_id(),
        )
        .await
        {
            Ok(effects) => effects,
            Err(e) => {
                error!(
                    conversation_id = self.stack.conversation_id(),
                    agent_id = self.stack.agent_id(),
                    state = entry.state.tag(),
                    error = %e,
                    "handler failed"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use parley_states::State;

    use crate::test_support::test_engine_context;
    use crate::{AgentResponse, Ask};

    use super::*;

    #[tokio::test]
    async fn empty_stack_is_a_noop() {
        let (ctx, _) = test_engine_context();
        let stack = ctx.stack("c1", "a1");
        let agent: Arc<dyn Agent> = Arc::new(crate::ScriptedAgent::new("a1", Vec::new()));
        let effects = AgentRuntime::new(&ctx, agent, &stack).step().await;
        assert!(effects.is_empty());
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        fn id(&self) -> &str {
            "boom"
        }
        async fn run(&self, _ask: Ask) -> anyhow::Result<Option<AgentResponse>> {
            anyhow::bail!("model unavailable")
        }
    }

    #[tokio::test]
    async fn handler_errors_are_swallowed() {
        let (ctx, _) = test_engine_context();
        let stack = ctx.stack("c1", "boom");
        stack.push(&[State::user("hi")]);
        let agent: Arc<dyn Agent> = Arc::new(FailingAgent);
        let effects = AgentRuntime::new(&ctx, agent, &stack).step().await;
        assert!(effects.is_empty());
        // the stack is untouched; the branch can be retried
        assert_eq!(stack.length(None), 1);
    }
}
