// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use parley_states::Envelope;

/// One scheduled pass over a conversation's live agents.
#[derive(Debug, Clone)]
pub struct TickJob {
    pub conversation_id: String,
    /// Re-enqueue depth within a single tick chain.
    pub round: u32,
}

/// Tool invocation shipped to the `tools` worker pool.  Carries a
/// serialized copy of the `ToolCall` state so the worker can replay it
/// without re-reading the stack.
#[derive(Debug, Clone)]
pub struct ToolJob {
    pub conversation_id: String,
    pub agent_id: String,
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    pub tool_call_id: String,
    pub branch_id: String,
    pub tool_state_env: Envelope,
}

/// A finished child's answer travelling back up to its parent.
#[derive(Debug, Clone)]
pub struct DelegateJob {
    pub conversation_id: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub correlation_id: String,
    pub text: String,
}

/// Judge work scheduled against a pending evaluation artifact.
#[derive(Debug, Clone)]
pub struct EvalJob {
    pub target_ref: String,
    pub evaluator_id: String,
    pub judge_version: String,
    pub payload: Value,
}

/// Jobs riding the `ticks` queue.
#[derive(Debug)]
pub enum TickQueueJob {
    Tick(TickJob),
    Delegate(DelegateJob),
}

/// Send half of the named work queues.  Cheap to clone; the engine owns
/// the matching [`QueueReceivers`].
#[derive(Clone)]
pub struct QueueRouter {
    ticks: mpsc::Sender<TickQueueJob>,
    tools: mpsc::Sender<ToolJob>,
    evals: mpsc::Sender<EvalJob>,
    rollouts: mpsc::Sender<Value>,
}

pub struct QueueReceivers {
    pub ticks: mpsc::Receiver<TickQueueJob>,
    pub tools: mpsc::Receiver<ToolJob>,
    pub evals: mpsc::Receiver<EvalJob>,
    pub rollouts: mpsc::Receiver<Value>,
}

impl QueueRouter {
    pub fn bounded(capacity: usize) -> (Self, QueueReceivers) {
        let (ticks_tx, ticks_rx) = mpsc::channel(capacity);
        let (tools_tx, tools_rx) = mpsc::channel(capacity);
        let (evals_tx, evals_rx) = mpsc::channel(capacity);
        let (rollouts_tx, rollouts_rx) = mpsc::channel(capacity);
        (
            Self {
                ticks: ticks_tx,
                tools: tools_tx,
                evals: evals_tx,
                rollouts: rollouts_tx,
            },
            QueueReceivers {
                ticks: ticks_rx,
                tools: tools_rx,
                evals: evals_rx,
                rollouts: rollouts_rx,
            },
        )
    }

    /// The single entry point for tick scheduling.  Deliberately free of
    /// rate limiting: duplicate enqueues are idempotent because the tick
    /// fence admits one worker per conversation at a time.
    pub fn enqueue_tick(&self, conversation_id: &str) {
        self.enqueue_tick_round(conversation_id, 0)
    }

    pub fn enqueue_tick_round(&self, conversation_id: &str, round: u32) {
        let job = TickQueueJob::Tick(TickJob {
            conversation_id: conversation_id.to_string(),
            round,
        });
        if let Err(e) = self.ticks.try_send(job) {
            warn!(conversation_id, error = %e, "tick enqueue dropped");
        }
    }

    pub fn enqueue_tool(&self, job: ToolJob) {
        let tool = job.tool_name.clone();
        if let Err(e) = self.tools.try_send(job) {
            warn!(tool, error = %e, "tool enqueue dropped");
        }
    }

    pub fn enqueue_delegate(&self, job: DelegateJob) {
        let conversation_id = job.conversation_id.clone();
        if let Err(e) = self.ticks.try_send(TickQueueJob::Delegate(job)) {
            warn!(conversation_id, error = %e, "delegate enqueue dropped");
        }
    }

    pub fn enqueue_eval(&self, job: EvalJob) {
        let target = job.target_ref.clone();
        if let Err(e) = self.evals.try_send(job) {
            warn!(target, error = %e, "eval enqueue dropped");
        }
    }

    pub fn enqueue_rollout(&self, payload: Value) {
        if let Err(e) = self.rollouts.try_send(payload) {
            warn!(error = %e, "rollout enqueue dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_jobs_arrive_in_order() {
        let (router, mut receivers) = QueueRouter::bounded(8);
        router.enqueue_tick("c1");
        router.enqueue_tick_round("c1", 3);
        let TickQueueJob::Tick(first) = receivers.ticks.try_recv().unwrap() else {
            panic!("expected tick");
        };
        assert_eq!(first.round, 0);
        let TickQueueJob::Tick(second) = receivers.ticks.try_recv().unwrap() else {
            panic!("expected tick");
        };
        assert_eq!(second.round, 3);
    }

    #[test]
    fn delegate_jobs_ride_the_ticks_queue() {
        let (router, mut receivers) = QueueRouter::bounded(8);
        router.enqueue_delegate(DelegateJob {
            conversation_id: "c1".into(),
            parent_agent_id: "p".into(),
            child_agent_id: "c".into(),
            correlation_id: "x".into(),
            text: "done".into(),
        });
        assert!(matches!(
            receivers.ticks.try_recv().unwrap(),
            TickQueueJob::Delegate(_)
        ));
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (router, _receivers) = QueueRouter::bounded(1);
        router.enqueue_tick("c1");
        // second enqueue overflows the capacity-1 queue and is dropped
        router.enqueue_tick("c1");
    }
}
