// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::error;

use parley_artifacts::EvalScheduler;
use parley_runtime::{EngineContext, EvalJob, QueueRouter};

/// Outcome of judging one artifact.
#[derive(Debug, Clone)]
pub struct Judgement {
    pub score: f64,
    pub review: Option<String>,
    pub metrics: Map<String, Value>,
    pub reward: Option<f64>,
}

/// An evaluator that scores finished trajectories.  LLM-backed judges live
/// outside this workspace; they plug in through this trait.
#[async_trait]
pub trait Judge: Send + Sync {
    fn id(&self) -> &str;
    fn version(&self) -> &str;
    async fn evaluate(&self, payload: &Value) -> anyhow::Result<Judgement>;
}

/// Registry of judges keyed by evaluator id.
#[derive(Default)]
pub struct EvaluatorRegistry {
    judges: RwLock<HashMap<String, Arc<dyn Judge>>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, judge: Arc<dyn Judge>) {
        self.judges
            .write()
            .unwrap()
            .insert(judge.id().to_string(), judge);
    }

    pub fn get(&self, evaluator_id: &str) -> Option<Arc<dyn Judge>> {
        self.judges.read().unwrap().get(evaluator_id).cloned()
    }
}

/// Deterministic judge for tests and wiring checks: constant score, no
/// review.
pub struct StaticJudge {
    id: String,
    version: String,
    score: f64,
}

impl StaticJudge {
    pub fn new(id: impl Into<String>, version: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            score,
        }
    }
}

#[async_trait]
impl Judge for StaticJudge {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn evaluate(&self, _payload: &Value) -> anyhow::Result<Judgement> {
        Ok(Judgement {
            score: self.score,
            review: None,
            metrics: Map::new(),
            reward: None,
        })
    }
}

/// Bridges `ArtifactBus::create_evaluation_for` onto the `evals` queue.
pub struct QueueEvalScheduler {
    queues: QueueRouter,
}

impl QueueEvalScheduler {
    pub fn new(queues: QueueRouter) -> Self {
        Self { queues }
    }
}

impl EvalScheduler for QueueEvalScheduler {
    fn schedule(&self, target_ref: &str, evaluator_id: &str, judge_version: &str, payload: Value) {
        self.queues.enqueue_eval(EvalJob {
            target_ref: target_ref.to_string(),
            evaluator_id: evaluator_id.to_string(),
            judge_version: judge_version.to_string(),
            payload,
        });
    }
}

/// Run one judge job and patch the pending evaluation artifact with the
/// verdict.  Failures are logged; the artifact stays pending for a later
/// retry.
pub async fn run_eval_job(ctx: &EngineContext, judges: &EvaluatorRegistry, job: EvalJob) {
    let Some(judge) = judges.get(&job.evaluator_id) else {
        error!(evaluator_id = job.evaluator_id, "evaluator not found");
        return;
    };

    match judge.evaluate(&job.payload).await {
        Ok(judgement) => {
            if let Err(e) = ctx.bus.patch_evaluation(
                &job.target_ref,
                judge.id(),
                judge.version(),
                judgement.score,
                &judgement.metrics,
                judgement.review.as_deref(),
                judgement.reward,
            ) {
                error!(
                    target_ref = job.target_ref,
                    error = %e,
                    "failed to record evaluation"
                );
            }
        }
        Err(e) => {
            error!(
                target_ref = job.target_ref,
                evaluator_id = job.evaluator_id,
                error = %e,
                "judge failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::engine::test_support::test_engine;

    use super::*;

    #[tokio::test]
    async fn judge_patches_pending_evaluation() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let judges = EvaluatorRegistry::new();
        judges.register(Arc::new(StaticJudge::new("reply_judge", "2", 0.8)));

        // a pending evaluation artifact linked to a state artifact
        let stack = ctx.stack("c1", "a1");
        stack.push(&[parley_states::State::assistant("answer")]);
        let target = ctx.bus.read_last_n(1, "c1", None)[0].0.ref_id.clone();
        let eval_ref = ctx
            .bus
            .create_evaluation_for(&target, "reply_judge", "0", Map::new())
            .unwrap();

        run_eval_job(
            &ctx,
            &judges,
            EvalJob {
                target_ref: eval_ref.clone(),
                evaluator_id: "reply_judge".into(),
                judge_version: "0".into(),
                payload: json!({}),
            },
        )
        .await;

        let (header, payload) = ctx.bus.get(&eval_ref).unwrap();
        assert_eq!(header.score, Some(0.8));
        assert_eq!(header.judge_version.as_deref(), Some("2"));
        assert_eq!(header.meta["status"], json!("finished"));
        assert_eq!(payload["score"], json!(0.8));
    }

    #[tokio::test]
    async fn unknown_evaluator_leaves_artifact_pending() {
        let (engine, _harness) = test_engine();
        let ctx = engine.context().clone();
        let judges = EvaluatorRegistry::new();

        let stack = ctx.stack("c1", "a1");
        stack.push(&[parley_states::State::assistant("answer")]);
        let target = ctx.bus.read_last_n(1, "c1", None)[0].0.ref_id.clone();
        let eval_ref = ctx
            .bus
            .create_evaluation_for(&target, "ghost", "0", Map::new())
            .unwrap();

        run_eval_job(
            &ctx,
            &judges,
            EvalJob {
                target_ref: eval_ref.clone(),
                evaluator_id: "ghost".into(),
                judge_version: "0".into(),
                payload: json!({}),
            },
        )
        .await;

        let (header, _) = ctx.bus.get(&eval_ref).unwrap();
        assert_eq!(header.meta["status"], json!("pending"));
    }
}
