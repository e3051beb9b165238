// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared fixtures for unit tests in this crate.
use std::sync::Arc;

use parley_artifacts::{ArtifactBus, MemoryDriver};
use parley_config::Config;
use parley_store::{ManualClock, MemoryStore};

use crate::{
    AgentRegistry, EngineContext, NoDedupPolicy, PostEffectRegistry, QueueReceivers, QueueRouter,
    RecordingMetrics, ToolRegistry,
};

pub(crate) struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<RecordingMetrics>,
    pub receivers: QueueReceivers,
}

/// Engine context over the in-memory store with a hand-cranked clock, a
/// recording metrics sink and empty registries.
pub(crate) fn test_engine_context() -> (EngineContext, TestHarness) {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let config = Arc::new(Config::default());
    let bus = Arc::new(ArtifactBus::new(
        store.clone(),
        Box::new(MemoryDriver::default()),
        clock.clone(),
        config.artifacts.max_per_session,
    ));
    let metrics = Arc::new(RecordingMetrics::default());
    let (queues, receivers) = QueueRouter::bounded(64);

    let ctx = EngineContext {
        store,
        clock: clock.clone(),
        bus,
        agents: Arc::new(AgentRegistry::new()),
        tools: Arc::new(ToolRegistry::new()),
        post_effects: Arc::new(PostEffectRegistry::with_builtins()),
        dedup: Arc::new(NoDedupPolicy),
        metrics: metrics.clone(),
        queues,
        config,
    };
    (
        ctx,
        TestHarness {
            clock,
            metrics,
            receivers,
        },
    )
}
