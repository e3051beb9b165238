// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The engine: tick driver, worker pools and wiring.
//!
//! [`Engine`] assembles an [`parley_runtime::EngineContext`] from a store,
//! registries and config, then runs the session-barrier loop plus the
//! `ticks` / `tools` / `evals` worker pools on tokio tasks.  Everything a
//! worker touches flows through the context — there are no globals, so
//! tests can run the exact production code paths against the in-memory
//! store.
mod delegate;
mod driver;
mod engine;
mod evals;
mod ticks;
mod tools;

pub use delegate::bubble_up_delegate;
pub use driver::TickDriver;
pub use engine::{Engine, EngineBuilder};
pub use evals::{EvaluatorRegistry, Judge, Judgement, QueueEvalScheduler, StaticJudge};
pub use ticks::{process_agent_tick, process_session_tick};
pub use tools::execute_tool;
