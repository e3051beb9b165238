// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Map};
use tracing::info;

use parley_runtime::{DelegateJob, EngineContext, PushAgentResult};

/// The delegate bridge: deliver a finished child's answer to its waiting
/// parent.  Runs exclusively as a `ticks`-queue job — the `Finished`
/// handler never pushes results upstream inline — so late/duplicate
/// delivery is handled in one place, by [`PushAgentResult`]'s guard-key
/// and duplicate checks.
pub fn bubble_up_delegate(ctx: &EngineContext, job: DelegateJob) {
    let mut result = Map::new();
    result.insert("content".to_string(), json!(job.text));
    result.insert("status".to_string(), json!("ok"));

    PushAgentResult {
        conversation_id: job.conversation_id.clone(),
        target_agent_id: job.parent_agent_id.clone(),
        correlation_id: job.correlation_id.clone(),
        result,
        child_agent_id: job.child_agent_id.clone(),
        score: None,
    }
    .execute(ctx);

    info!(
        conversation_id = job.conversation_id,
        parent_agent_id = job.parent_agent_id,
        child_agent_id = job.child_agent_id,
        "delegate result bridged"
    );
}

#[cfg(test)]
mod tests {
    use parley_stack::keys;
    use parley_states::{State, WaitKind};

    use crate::engine::test_support::test_engine;

    use super::*;

    fn job() -> DelegateJob {
        DelegateJob {
            conversation_id: "c1".into(),
            parent_agent_id: "parent".into(),
            child_agent_id: "child".into(),
            correlation_id: "corr".into(),
            text: "done".into(),
        }
    }

    #[tokio::test]
    async fn timely_result_settles_the_parent_wait() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let stack = ctx.stack("c1", "parent");
        stack.push(&[
            State::user("q"),
            State::Waiting {
                kind: WaitKind::Agent,
                deadline: f64::MAX,
                correlation_id: Some("corr".into()),
            },
        ]);
        ctx.store
            .set_ex(&keys::expect_agent_result("c1", "parent", "corr"), "1", 600);
        ctx.store.set(&keys::child_to_parent("c1", "child"), "parent");

        bubble_up_delegate(&ctx, job());

        match stack.current(None).unwrap().state {
            State::AgentResult {
                correlation_id,
                result,
                ..
            } => {
                assert_eq!(correlation_id, "corr");
                assert_eq!(result["content"], json!("done"));
            }
            other => panic!("expected agent result, got {other:?}"),
        }
        // guard consumed, linkage cleaned
        assert!(!ctx
            .store
            .exists(&keys::expect_agent_result("c1", "parent", "corr")));
        assert!(!ctx.store.exists(&keys::child_to_parent("c1", "child")));
    }

    #[tokio::test]
    async fn late_result_is_dropped() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let stack = ctx.stack("c1", "parent");
        stack.push(&[State::user("q")]);
        // no guard key: the wait expired long ago

        bubble_up_delegate(&ctx, job());

        assert_eq!(stack.length(None), 1);
    }

    #[tokio::test]
    async fn duplicate_result_is_not_pushed_twice() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let stack = ctx.stack("c1", "parent");
        stack.push(&[State::user("q")]);

        for _ in 0..2 {
            ctx.store
                .set_ex(&keys::expect_agent_result("c1", "parent", "corr"), "1", 600);
            bubble_up_delegate(&ctx, job());
        }

        let results = stack
            .iter_last_n(10)
            .into_iter()
            .filter(|e| matches!(e.state, State::AgentResult { .. }))
            .count();
        assert_eq!(results, 1);
    }
}
