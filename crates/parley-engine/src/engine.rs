// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use parley_artifacts::{ArtifactBus, FsDriver, StorageDriver};
use parley_config::{Config, DedupPolicyKind};
use parley_runtime::{
    Agent, AgentRegistry, DedupPolicy, EngineContext, Metrics, NoDedupPolicy, PenaltyDedupPolicy,
    PostEffect, PostEffectRegistry, QueueReceivers, QueueRouter, StrictDedupPolicy, TickQueueJob,
    Tool, ToolJob, ToolRegistry, TracingMetrics,
};
use parley_stack::keys;
use parley_states::State;
use parley_store::{Clock, MemoryStore, Store, SystemClock};

use crate::evals::{run_eval_job, EvaluatorRegistry, Judge, QueueEvalScheduler};
use crate::{bubble_up_delegate, execute_tool, process_session_tick, TickDriver};

/// Assembles an [`EngineContext`] and the workers around it.
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    storage: Option<Box<dyn StorageDriver>>,
    metrics: Option<Arc<dyn Metrics>>,
    dedup: Option<Arc<dyn DedupPolicy>>,
    post_effects: PostEffectRegistry,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            storage: None,
            metrics: None,
            dedup: None,
            post_effects: PostEffectRegistry::with_builtins(),
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn storage_driver(mut self, driver: Box<dyn StorageDriver>) -> Self {
        self.storage = Some(driver);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the policy selected by `config.dedup.policy`.
    pub fn dedup_policy(mut self, policy: Arc<dyn DedupPolicy>) -> Self {
        self.dedup = Some(policy);
        self
    }

    pub fn post_effect(mut self, handler: Arc<dyn PostEffect>) -> Self {
        self.post_effects.register(handler);
        self
    }

    pub fn build(self) -> Engine {
        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock.clone())));
        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(FsDriver::new(config.artifacts.base_dir.clone())));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(TracingMetrics));

        let bus = Arc::new(ArtifactBus::new(
            store.clone(),
            storage,
            clock.clone(),
            config.artifacts.max_per_session,
        ));
        let (queues, receivers) = QueueRouter::bounded(config.queues.capacity);
        let agents = Arc::new(AgentRegistry::new());
        let tools = Arc::new(ToolRegistry::new());

        let dedup = self.dedup.unwrap_or_else(|| match config.dedup.policy {
            DedupPolicyKind::None => Arc::new(NoDedupPolicy),
            DedupPolicyKind::Penalty => Arc::new(PenaltyDedupPolicy::new(
                store.clone(),
                tools.clone(),
                metrics.clone(),
                config.dedup.ttl_secs,
            )),
            DedupPolicyKind::Strict => Arc::new(StrictDedupPolicy::new(
                store.clone(),
                tools.clone(),
                metrics.clone(),
                config.dedup.ttl_secs,
            )),
        });

        let ctx = EngineContext {
            store,
            clock,
            bus: bus.clone(),
            agents,
            tools,
            post_effects: Arc::new(self.post_effects),
            dedup,
            metrics,
            queues,
            config,
        };

        let judges = Arc::new(EvaluatorRegistry::new());
        bus.set_eval_scheduler(Arc::new(QueueEvalScheduler::new(ctx.queues.clone())));

        let (shutdown_tx, _) = watch::channel(false);
        Engine {
            ctx,
            judges,
            receivers: Some(receivers),
            rollouts: None,
            shutdown_tx,
            handles: Vec::new(),
        }
    }
}

/// The running engine: context plus driver and worker tasks.
///
/// Register agents, tools and judges, then call [`Engine::start`].  All
/// state lives in the store, so dropping the engine loses nothing a fresh
/// one cannot pick back up.
pub struct Engine {
    ctx: EngineContext,
    judges: Arc<EvaluatorRegistry>,
    receivers: Option<QueueReceivers>,
    rollouts: Option<mpsc::Receiver<serde_json::Value>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.ctx.agents.register(agent);
    }

    pub fn register_tool(&self, tool: impl Tool + 'static) {
        self.ctx.tools.register(tool);
    }

    pub fn register_judge(&self, judge: Arc<dyn Judge>) {
        self.judges.register(judge);
    }

    /// Hand over the `rollouts` queue to an external consumer.  The queue
    /// is a destination only; no built-in worker drains it.
    pub fn take_rollout_queue(&mut self) -> Option<mpsc::Receiver<serde_json::Value>> {
        self.rollouts.take()
    }

    #[cfg(test)]
    pub(crate) fn take_receivers(&mut self) -> Option<QueueReceivers> {
        self.receivers.take()
    }

    /// Spawn the tick driver and the worker pools.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let receivers = self
            .receivers
            .take()
            .context("engine already started")?;
        self.rollouts = Some(receivers.rollouts);

        let shutdown = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(
            TickDriver::new(self.ctx.clone()).run(shutdown),
        ));

        let ticks_rx = Arc::new(Mutex::new(receivers.ticks));
        for _ in 0..self.ctx.config.queues.tick_workers.max(1) {
            self.handles.push(tokio::spawn(tick_worker_loop(
                self.ctx.clone(),
                ticks_rx.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        let tools_rx = Arc::new(Mutex::new(receivers.tools));
        for _ in 0..self.ctx.config.queues.tool_workers.max(1) {
            self.handles.push(tokio::spawn(tool_worker_loop(
                self.ctx.clone(),
                tools_rx.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        self.handles.push(tokio::spawn(eval_worker_loop(
            self.ctx.clone(),
            self.judges.clone(),
            receivers.evals,
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// External input entry point: land a user message on the agent's
    /// current branch and wake the conversation.  The push registers the
    /// agent lazily, so no prior setup is needed.
    pub fn post_user_message(&self, conversation_id: &str, agent_id: &str, text: &str) {
        let stack = self.ctx.stack(conversation_id, agent_id);
        stack.push(&[State::user(text)]);
        self.ctx.enqueue_tick(conversation_id);
    }

    /// Latest system reply for the conversation, if any.  An empty string
    /// means a timeout occurred and there is no answer.
    pub fn response(&self, conversation_id: &str) -> Option<String> {
        self.ctx.store.get(&keys::response(conversation_id))
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        debug!("engine stopped");
    }
}

async fn recv_shared<T>(rx: &Arc<Mutex<mpsc::Receiver<T>>>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn tick_worker_loop(
    ctx: EngineContext,
    rx: Arc<Mutex<mpsc::Receiver<TickQueueJob>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = recv_shared(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        match job {
            TickQueueJob::Tick(tick) => {
                process_session_tick(&ctx, &tick.conversation_id, tick.round).await;
            }
            TickQueueJob::Delegate(delegate) => bubble_up_delegate(&ctx, delegate),
        }
    }
}

async fn tool_worker_loop(
    ctx: EngineContext,
    rx: Arc<Mutex<mpsc::Receiver<ToolJob>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = recv_shared(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        let conversation_id = job.conversation_id.clone();
        let tool_name = job.tool_name.clone();
        if let Err(e) = execute_tool(&ctx, job).await {
            // Stack corruption aborts this task only; the pool keeps going.
            error!(conversation_id, tool_name, error = %e, "tool task aborted");
        }
    }
}

async fn eval_worker_loop(
    ctx: EngineContext,
    judges: Arc<EvaluatorRegistry>,
    mut rx: mpsc::Receiver<parley_runtime::EvalJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        run_eval_job(&ctx, &judges, job).await;
    }
}
