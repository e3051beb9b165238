// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Agent, AgentBehavior, AgentResponse, Ask};

/// Pre-scripted agent for tests.  Each `run` pops the next canned response
/// from the front of the script; once the script is exhausted it falls back
/// to the default reply (or `None`).  Every `Ask` is recorded so tests can
/// inspect the transcript the runtime actually rendered.
pub struct ScriptedAgent {
    id: String,
    behavior: AgentBehavior,
    script: Mutex<VecDeque<Option<AgentResponse>>>,
    fallback: Option<AgentResponse>,
    asks: Mutex<Vec<Ask>>,
}

impl ScriptedAgent {
    /// Agent that answers with `responses` in order, then goes silent.
    pub fn new(id: impl Into<String>, responses: Vec<AgentResponse>) -> Self {
        Self {
            id: id.into(),
            behavior: AgentBehavior::default(),
            script: Mutex::new(responses.into_iter().map(Some).collect()),
            fallback: None,
            asks: Mutex::new(Vec::new()),
        }
    }

    /// Agent that always answers with the same text.
    pub fn always_reply(id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut agent = Self::new(id, Vec::new());
        agent.fallback = Some(AgentResponse::reply(message));
        agent
    }

    pub fn with_behavior(mut self, behavior: AgentBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Append a turn where the agent returns nothing at all.
    pub fn then_silence(self) -> Self {
        self.script.lock().unwrap().push_back(None);
        self
    }

    /// Transcripts seen so far, in invocation order.
    pub fn asks(&self) -> Vec<Ask> {
        self.asks.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.asks.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn behavior(&self) -> AgentBehavior {
        self.behavior.clone()
    }

    async fn run(&self, ask: Ask) -> anyhow::Result<Option<AgentResponse>> {
        self.asks.lock().unwrap().push(ask);
        let next = self.script.lock().unwrap().pop_front();
        Ok(match next {
            Some(response) => response,
            None => self.fallback.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask() -> Ask {
        Ask {
            history: Vec::new(),
            conversation_id: "c1".into(),
        }
    }

    #[tokio::test]
    async fn script_pops_in_order_then_falls_back() {
        let agent = ScriptedAgent::new(
            "a1",
            vec![AgentResponse::reply("one"), AgentResponse::reply("two")],
        );
        assert_eq!(
            agent.run(ask()).await.unwrap(),
            Some(AgentResponse::reply("one"))
        );
        assert_eq!(
            agent.run(ask()).await.unwrap(),
            Some(AgentResponse::reply("two"))
        );
        assert_eq!(agent.run(ask()).await.unwrap(), None);
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn always_reply_never_runs_dry() {
        let agent = ScriptedAgent::always_reply("a1", "hi");
        for _ in 0..3 {
            assert_eq!(
                agent.run(ask()).await.unwrap(),
                Some(AgentResponse::reply("hi"))
            );
        }
    }

    #[tokio::test]
    async fn silence_turn_returns_none_mid_script() {
        let agent = ScriptedAgent::new("a1", vec![AgentResponse::reply("one")]).then_silence();
        assert!(agent.run(ask()).await.unwrap().is_some());
        assert!(agent.run(ask()).await.unwrap().is_none());
    }
}
