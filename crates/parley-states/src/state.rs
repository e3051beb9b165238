// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a `Waiting` frame is suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Llm,
    Tool,
    Agent,
    UserInput,
}

/// One frame on an interaction stack.
///
/// The serde tag doubles as the envelope variant tag, so renaming a variant
/// is a wire-format change and needs a version bump (see
/// [`crate::codec::supported_version`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum State {
    /// External or synthetic prompt.
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
    /// Final or intermediate reply from the agent.
    AssistantMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
    /// Scheduling marker for a tool invocation.  `id` is the stable hash of
    /// `(function_name, arguments)` and correlates the eventual result.
    ToolCall {
        id: String,
        function_name: String,
        arguments: Map<String, Value>,
    },
    /// Outcome of a tool invocation.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Map<String, Value>>,
        /// Scalar credit: 1 on success, 0 on failure/timeout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reward: Option<f64>,
    },
    /// Delegation request to another agent.
    AgentCall { agent_id: String, message: String },
    /// Result a child agent sends back to its parent.
    AgentResult {
        correlation_id: String,
        result: Map<String, Value>,
        /// Optional holistic evaluation score injected later by a judge.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    /// The branch is paused pending human input.
    UserInputRequest { text: String },
    /// Continuation after human input.
    UserResponse { text: String },
    /// Suspension marker for an asynchronous edge (LLM, tool, delegation,
    /// human).  `deadline` is an absolute wall-clock epoch after which the
    /// wait is considered expired.
    Waiting {
        kind: WaitKind,
        deadline: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    /// Terminal marker for the branch.
    Finished,
}

impl State {
    pub fn user(text: impl Into<String>) -> Self {
        Self::UserMessage {
            text: text.into(),
            meta: None,
        }
    }

    pub fn user_with_meta(text: impl Into<String>, meta: impl Into<String>) -> Self {
        Self::UserMessage {
            text: text.into(),
            meta: Some(meta.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::AssistantMessage {
            content: Some(content.into()),
            tool_calls: None,
            meta: None,
        }
    }

    /// The envelope variant tag for this state.
    pub fn tag(&self) -> &'static str {
        match self {
            State::UserMessage { .. } => "user_message",
            State::AssistantMessage { .. } => "assistant_message",
            State::ToolCall { .. } => "tool_call",
            State::ToolResult { .. } => "tool_result",
            State::AgentCall { .. } => "agent_call",
            State::AgentResult { .. } => "agent_result",
            State::UserInputRequest { .. } => "user_input_request",
            State::UserResponse { .. } => "user_response",
            State::Waiting { .. } => "waiting",
            State::Finished => "finished",
        }
    }

    /// Schema version written into the envelope for this variant.
    pub fn version(&self) -> u8 {
        // All variants are at v1; bump per variant on incompatible change.
        1
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Finished)
    }

    /// Seconds until a `Waiting` deadline; negative means already expired.
    /// Returns `None` for every other variant.
    pub fn remaining(&self, now: f64) -> Option<f64> {
        match self {
            State::Waiting { deadline, .. } => Some(deadline - now),
            _ => None,
        }
    }

    /// True iff this is a `Waiting` frame whose deadline has passed.
    pub fn is_expired(&self, now: f64) -> bool {
        matches!(self.remaining(now), Some(r) if r <= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(State::user("hi").tag(), "user_message");
        assert_eq!(State::Finished.tag(), "finished");
        let w = State::Waiting {
            kind: WaitKind::Tool,
            deadline: 0.0,
            correlation_id: None,
        };
        assert_eq!(w.tag(), "waiting");
    }

    #[test]
    fn waiting_expiry() {
        let w = State::Waiting {
            kind: WaitKind::Agent,
            deadline: 100.0,
            correlation_id: Some("c1".into()),
        };
        assert!(!w.is_expired(99.9));
        assert!(w.is_expired(100.0));
        assert_eq!(w.remaining(90.0), Some(10.0));
    }

    #[test]
    fn non_waiting_states_never_expire() {
        assert!(!State::user("x").is_expired(f64::MAX));
        assert!(!State::Finished.is_expired(f64::MAX));
    }

    #[test]
    fn wait_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WaitKind::UserInput).unwrap(),
            json!("user_input")
        );
    }

    #[test]
    fn optional_fields_are_omitted() {
        let v = serde_json::to_value(State::assistant("ok")).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("tool_calls"));
        assert!(!obj.contains_key("meta"));
    }
}
