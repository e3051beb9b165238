// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turn a slice of the interaction stack into chat-completion messages.
use serde_json::json;

use parley_stack::{InteractionStack, SYNTHETIC_SEED};
use parley_states::State;

use crate::ChatMessage;

/// States that never reach the model.
fn internal_only(state: &State) -> bool {
    matches!(
        state,
        State::AgentCall { .. }
            | State::AgentResult { .. }
            | State::Waiting { .. }
            | State::Finished
            | State::UserInputRequest { .. }
    )
}

/// Render the newest `last_n` entries of the current branch as a chat
/// transcript, oldest first.  `exclude_tags` drops whole state kinds by
/// their variant tag (used when a parent re-answers without seeing the
/// child's result).
pub fn render_transcript(
    stack: &InteractionStack,
    last_n: usize,
    exclude_tags: &[&str],
) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut last_assistant_had_tool_calls = false;

    for entry in stack.iter_last_n(last_n) {
        let state = entry.state;
        if exclude_tags.contains(&state.tag()) || internal_only(&state) {
            continue;
        }

        match state {
            State::UserMessage { text, .. } => {
                if text == SYNTHETIC_SEED {
                    continue;
                }
                out.push(ChatMessage::user(text));
                last_assistant_had_tool_calls = false;
            }
            State::UserResponse { text } => {
                out.push(ChatMessage::user(text));
                last_assistant_had_tool_calls = false;
            }
            State::AssistantMessage {
                content,
                tool_calls,
                ..
            } => {
                last_assistant_had_tool_calls = tool_calls.is_some();
                out.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(content.unwrap_or_default()),
                    tool_call_id: None,
                    name: None,
                    tool_calls: tool_calls.map(|calls| json!(calls)),
                });
            }
            State::ToolCall {
                id,
                function_name,
                arguments,
            } => {
                let arguments_json =
                    serde_json::to_string(&arguments).unwrap_or_else(|_| "{}".to_string());
                out.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_call_id: None,
                    name: None,
                    tool_calls: Some(json!([{
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": function_name,
                            "arguments": arguments_json,
                        },
                    }])),
                });
                last_assistant_had_tool_calls = true;
            }
            State::ToolResult {
                tool_call_id,
                tool_name,
                result,
                reward,
                ..
            } => {
                // A tool message is only valid after an assistant message
                // that announced the call.
                if last_assistant_had_tool_calls {
                    let mut payload = result;
                    if let Some(reward) = reward {
                        payload.insert("reward".to_string(), json!(reward));
                    }
                    out.push(ChatMessage {
                        role: "tool".to_string(),
                        content: Some(
                            serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string()),
                        ),
                        tool_call_id: Some(tool_call_id),
                        name: Some(tool_name),
                        tool_calls: None,
                    });
                }
                last_assistant_had_tool_calls = false;
            }
            State::AgentCall { .. }
            | State::AgentResult { .. }
            | State::Waiting { .. }
            | State::UserInputRequest { .. }
            | State::Finished => unreachable!("internal-only states are filtered above"),
        }
    }
    out
}
