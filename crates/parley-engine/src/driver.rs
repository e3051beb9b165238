// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use parley_stack::{keys, Session};
use parley_runtime::EngineContext;

/// TTL of the advisory fence serialising tick advancement for one
/// conversation.  Replaces optimistic WATCH/MULTI concurrency: a fence
/// miss means another driver holds the section, so skip this round.
const ADVANCE_FENCE_TTL_SECS: u64 = 5;

#[derive(Debug, PartialEq, Eq)]
enum Advance {
    Advanced(u64),
    StillWaiting,
    NoAgents,
    Contended,
}

/// The session-barrier loop.
///
/// Each poll interval it scans the active-session set, logs stalled ticks,
/// and attempts to advance every conversation whose waiting set has
/// drained.  A successful advance enqueues a session tick.  The barrier is
/// never forced: a stuck tick only resolves through per-state deadlines.
pub struct TickDriver {
    ctx: EngineContext,
}

impl TickDriver {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.ctx.config.tick.poll_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => self.poll_once(),
            }
        }
        debug!("tick driver stopped");
    }

    /// One scan over every active conversation.  Public so tests (and
    /// embedders with their own scheduling) can drive the loop by hand.
    pub fn poll_once(&self) {
        for conversation_id in self.ctx.store.smembers(keys::ACTIVE_SESSIONS) {
            let session = self.ctx.session(&conversation_id);
            let current = session.tick();

            self.log_stalled_tick(&session, current);

            match self.advance_tick(&session, current) {
                Advance::Advanced(next) => {
                    let tick = next.to_string();
                    self.ctx.metrics.emit(
                        "tick_started",
                        1.0,
                        &[
                            ("conversation_id", conversation_id.as_str()),
                            ("tick", tick.as_str()),
                        ],
                    );
                    self.ctx.enqueue_tick(&conversation_id);
                }
                Advance::NoAgents => {
                    self.ctx
                        .store
                        .srem(keys::ACTIVE_SESSIONS, &conversation_id);
                    self.ctx.metrics.emit(
                        "session_finished",
                        1.0,
                        &[("conversation_id", conversation_id.as_str())],
                    );
                    info!(session_id = conversation_id, "session finished, no live agents");
                }
                Advance::StillWaiting | Advance::Contended => {}
            }
        }
    }

    /// One-shot stall log per (conversation, tick), deduplicated for 30 s.
    fn log_stalled_tick(&self, session: &Session, current: u64) {
        let Some(start) = session.tick_start(current) else {
            return;
        };
        let age = self.ctx.clock.now() - start;
        if age <= self.ctx.config.tick.timeout_secs as f64 {
            return;
        }
        let dedup = keys::tick_timeout_logged(session.conversation_id(), current);
        if self.ctx.store.set_nx_ex(&dedup, "1", 30) {
            let stalled: Vec<String> = session.waiting(current).into_iter().collect();
            error!(
                conversation_id = session.conversation_id(),
                tick = current,
                stalled_agents = ?stalled,
                "tick timeout"
            );
            self.ctx.metrics.emit(
                "tick_timeout",
                1.0,
                &[("conversation_id", session.conversation_id())],
            );
            // Nudge the stalled conversation so expired waiting frames get
            // converted into timeout results.  Rate-limited by the dedup
            // key above; the barrier itself is never forced.
            self.ctx.enqueue_tick(session.conversation_id());
        }
    }

    fn advance_tick(&self, session: &Session, current: u64) -> Advance {
        let fence = keys::tick_advance_fence(session.conversation_id());
        if !self
            .ctx
            .store
            .set_nx_ex(&fence, "1", ADVANCE_FENCE_TTL_SECS)
        {
            return Advance::Contended;
        }
        let outcome = self.advance_locked(session, current);
        self.ctx.store.del(&fence);
        outcome
    }

    fn advance_locked(&self, session: &Session, current: u64) -> Advance {
        let conversation_id = session.conversation_id();
        let waiting = session.waiting(current);
        let finished = session.finished();
        if waiting.difference(&finished).next().is_some() {
            return Advance::StillWaiting;
        }

        // Garbage-collect registered agents that never heart-beat.
        let heartbeat_key = keys::agent_last_active(conversation_id);
        for agent_id in session.agents() {
            if self.ctx.store.hget(&heartbeat_key, &agent_id).is_none() {
                self.ctx
                    .store
                    .srem(&keys::session_agents(conversation_id), &agent_id);
            }
        }

        let next = current + 1;
        let waiting_next = keys::session_waiting(conversation_id, next);
        let start_next = keys::tick_start_time(conversation_id, next);

        let live = session.live_agents();
        if live.is_empty() {
            self.ctx.store.del(&waiting_next);
            self.ctx.store.del(&start_next);
            return Advance::NoAgents;
        }

        session.set_tick(next);
        self.ctx.store.del(&waiting_next);
        for agent_id in &live {
            self.ctx.store.sadd(&waiting_next, agent_id);
        }
        self.ctx
            .store
            .set(&start_next, &self.ctx.clock.now().to_string());
        Advance::Advanced(next)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::test_support::test_engine;
    use parley_runtime::TickQueueJob;
    use parley_store::Clock;

    use super::*;

    #[test]
    fn advance_waits_for_waiting_set_to_drain() {
        let (engine, mut harness) = test_engine();
        let ctx = engine.context().clone();
        let session = ctx.session("c1");
        session.register_agent("a1");
        session.ack_tick("a1", 0);
        ctx.store.sadd(&keys::session_waiting("c1", 0), "a1");

        let driver = TickDriver::new(ctx.clone());
        driver.poll_once();
        // a1 still owes tick 0, so no advance happened
        assert_eq!(session.tick(), 0);
        assert!(harness.receivers.ticks.try_recv().is_err());

        session.add_finished("a1");
        driver.poll_once();
        // waiting ⊆ finished, but no live agent remains → session retires
        assert!(!ctx.store.sismember(keys::ACTIVE_SESSIONS, "c1"));
        assert_eq!(harness.metrics.count("session_finished"), 1);
    }

    #[test]
    fn advance_moves_barrier_and_enqueues_tick() {
        let (engine, mut harness) = test_engine();
        let ctx = engine.context().clone();
        let session = ctx.session("c1");
        session.register_agent("a1");
        session.ack_tick("a1", 0);

        TickDriver::new(ctx.clone()).poll_once();

        assert_eq!(session.tick(), 1);
        assert_eq!(session.waiting(1), ["a1".to_string()].into());
        assert!(session.tick_start(1).is_some());
        assert!(matches!(
            harness.receivers.ticks.try_recv().unwrap(),
            TickQueueJob::Tick(_)
        ));
        assert_eq!(harness.metrics.count("tick_started"), 1);
    }

    #[test]
    fn dead_agents_are_garbage_collected() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let session = ctx.session("c1");
        session.register_agent("alive");
        session.register_agent("ghost");
        session.ack_tick("alive", 0);

        TickDriver::new(ctx.clone()).poll_once();

        assert!(!session.agents().contains("ghost"));
        assert_eq!(session.waiting(1), ["alive".to_string()].into());
    }

    #[test]
    fn stalled_tick_logs_once_per_window() {
        let (engine, harness) = test_engine();
        let ctx = engine.context().clone();
        let session = ctx.session("c1");
        session.register_agent("a1");
        session.ack_tick("a1", 0);
        ctx.store.sadd(&keys::session_waiting("c1", 0), "a1");
        // make the waiting set unsatisfiable and the tick ancient
        ctx.store.set(
            &keys::tick_start_time("c1", 0),
            &(harness.clock.now() - 120.0).to_string(),
        );

        let driver = TickDriver::new(ctx.clone());
        driver.poll_once();
        driver.poll_once();
        assert_eq!(harness.metrics.count("tick_timeout"), 1);
    }

    #[test]
    fn contended_fence_skips_the_round() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let session = ctx.session("c1");
        session.register_agent("a1");
        session.ack_tick("a1", 0);
        ctx.store
            .set_nx_ex(&keys::tick_advance_fence("c1"), "1", 60);

        TickDriver::new(ctx.clone()).poll_once();
        assert_eq!(session.tick(), 0);
    }
}
