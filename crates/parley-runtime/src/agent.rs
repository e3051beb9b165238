// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One chat-completion style message rendered from the interaction stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::plain("user", text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain("assistant", text)
    }

    fn plain(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(text.into()),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }
}

/// The request handed to an agent on each invocation.
#[derive(Debug, Clone)]
pub struct Ask {
    pub history: Vec<ChatMessage>,
    pub conversation_id: String,
}

/// What an agent produced for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    /// Final or intermediate textual turn.
    Reply { message: String },
    /// Request to run a tool.
    FunctionCall {
        function_name: String,
        arguments: Map<String, Value>,
    },
}

impl AgentResponse {
    pub fn reply(message: impl Into<String>) -> Self {
        Self::Reply {
            message: message.into(),
        }
    }

    pub fn function_call(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::FunctionCall {
            function_name: name.into(),
            arguments,
        }
    }
}

/// Per-agent critique behaviour.
#[derive(Debug, Clone, Default)]
pub struct AgentBehavior {
    /// After finishing, prompt the agent to critique its own answer
    /// (bounded by the configured reflection budget).
    pub enable_self_reflection: bool,
    /// After finishing, delegate a critique of the final answer to this
    /// agent instead.
    pub reflection_agent_id: Option<String>,
}

/// A conversational participant: LLM-driven or deterministic.
///
/// `run` receives the rendered transcript and returns either a textual
/// reply, a tool request, or `None` when the agent has nothing to say.
/// Implementations must be stateless across invocations — everything they
/// need is in the transcript.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn behavior(&self) -> AgentBehavior {
        AgentBehavior::default()
    }

    async fn run(&self, ask: Ask) -> anyhow::Result<Option<AgentResponse>>;
}

/// Registry of participants, keyed by agent id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn Agent>) {
        self.agents
            .write()
            .unwrap()
            .insert(agent.id().to_string(), agent);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().unwrap().get(agent_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn function_call_from_non_object_wraps_value() {
        let call = AgentResponse::function_call("echo", json!([1, 2]));
        let AgentResponse::FunctionCall { arguments, .. } = call else {
            panic!("expected function call");
        };
        assert_eq!(arguments["value"], json!([1, 2]));
    }

    #[test]
    fn chat_message_omits_empty_fields() {
        let raw = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(raw, r#"{"role":"user","content":"hi"}"#);
    }

    struct Dummy(String);

    #[async_trait]
    impl Agent for Dummy {
        fn id(&self) -> &str {
            &self.0
        }
        async fn run(&self, _ask: Ask) -> anyhow::Result<Option<AgentResponse>> {
            Ok(None)
        }
    }

    #[test]
    fn registry_lookup_and_latest_wins() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(Dummy("a".into())));
        registry.register(Arc::new(Dummy("b".into())));
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.ids(), vec!["a", "b"]);
    }
}
