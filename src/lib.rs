// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parley: a distributed orchestration engine for stateful conversational
//! agents.
//!
//! Agents collaborate on a *conversation*: they exchange messages, invoke
//! tools, delegate to child agents and produce a final answer together.
//! Every step is a typed state on a per-(conversation, agent) interaction
//! stack with copy-on-write branching, driven by a replayable state
//! machine and persisted to the artifact bus for audit, what-if re-runs
//! and evaluation.
//!
//! This crate is a facade over the workspace members:
//!
//! - [`states`] — the state sum type and versioned envelope codec
//! - [`store`] — the key-value store abstraction and in-memory engine
//! - [`artifacts`] — durable artifact storage with a pointer index
//! - [`stack`] — interaction stacks, branching, the session registry
//! - [`runtime`] — handlers, effects, dedup policies, the effect executor
//! - [`engine`] — the tick driver, worker pools and engine builder
//! - [`config`] — layered YAML configuration
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley::{Engine, ScriptedAgent};
//!
//! # #[tokio::main] async fn main() -> anyhow::Result<()> {
//! let mut engine = Engine::builder(parley::Config::default()).build();
//! engine.register_agent(Arc::new(ScriptedAgent::always_reply("helper", "hello")));
//! engine.start()?;
//! engine.post_user_message("conv-1", "helper", "hi there");
//! # Ok(()) }
//! ```
pub use parley_artifacts as artifacts;
pub use parley_config as config;
pub use parley_engine as engine;
pub use parley_runtime as runtime;
pub use parley_stack as stack;
pub use parley_states as states;
pub use parley_store as store;

pub use parley_config::Config;
pub use parley_engine::{Engine, EngineBuilder, EvaluatorRegistry, Judge, StaticJudge};
pub use parley_runtime::{
    Agent, AgentBehavior, AgentResponse, Ask, ChatMessage, Effect, EngineContext, ScriptedAgent,
    Tool, ToolConfig, ToolContext,
};
pub use parley_stack::{InteractionStack, Session};
pub use parley_states::State;
pub use parley_store::{Clock, ManualClock, MemoryStore, Store, SystemClock};
