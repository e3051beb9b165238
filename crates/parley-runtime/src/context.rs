// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use parley_artifacts::ArtifactBus;
use parley_config::Config;
use parley_stack::{InteractionStack, Session, StackContext};
use parley_store::{Clock, Store};

use crate::{AgentRegistry, DedupPolicy, Metrics, PostEffectRegistry, QueueRouter, ToolRegistry};

/// Everything a worker, driver or handler needs, explicitly constructed
/// and passed around — there is no process-global state.  Tests build one
/// with the in-memory store, scripted agents and a recording metrics sink.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<ArtifactBus>,
    pub agents: Arc<AgentRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub post_effects: Arc<PostEffectRegistry>,
    pub dedup: Arc<dyn DedupPolicy>,
    pub metrics: Arc<dyn Metrics>,
    pub queues: QueueRouter,
    pub config: Arc<Config>,
}

impl EngineContext {
    pub fn stack_context(&self) -> StackContext {
        StackContext {
            store: self.store.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
            config: self.config.stack.clone(),
        }
    }

    pub fn session(&self, conversation_id: &str) -> Session {
        Session::new(self.stack_context(), conversation_id)
    }

    pub fn stack(&self, conversation_id: &str, agent_id: &str) -> InteractionStack {
        InteractionStack::new(self.stack_context(), conversation_id, agent_id)
    }

    /// Single entry point for tick scheduling (see [`QueueRouter::enqueue_tick`]).
    pub fn enqueue_tick(&self, conversation_id: &str) {
        self.queues.enqueue_tick(conversation_id)
    }
}
