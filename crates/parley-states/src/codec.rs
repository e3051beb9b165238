// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::{Read, Write};

use base64::prelude::*;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::State;

/// Payloads above this many serialized bytes are gzip-compressed.
pub const DEFAULT_GZIP_THRESHOLD: usize = 2_048;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown state variant '{0}'")]
    UnknownVariant(String),
    #[error("cannot decode {variant} v{found}: runtime understands only up to v{supported}")]
    IncompatibleVersion {
        variant: String,
        found: u8,
        supported: u8,
    },
    #[error("corrupt envelope payload: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Wire envelope for a single state.
///
/// Layout: `{v, t, ts, data [, compressed]}` where `data` is the raw state
/// object, or the base64 of its gzipped JSON when `compressed` is set.
/// Legacy envelopes may carry `data` as a JSON-encoded string; `decode`
/// accepts both shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub t: String,
    pub ts: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    pub data: Value,
}

/// Highest envelope version this runtime can decode for a given variant tag.
pub fn supported_version(tag: &str) -> Option<u8> {
    match tag {
        "user_message" | "assistant_message" | "tool_call" | "tool_result" | "agent_call"
        | "agent_result" | "user_input_request" | "user_response" | "waiting" | "finished" => {
            Some(1)
        }
        _ => None,
    }
}

/// Encode a state with the default compression threshold.
pub fn encode(state: &State, ts: f64) -> Envelope {
    encode_with_threshold(state, ts, DEFAULT_GZIP_THRESHOLD)
}

/// Encode a state into an envelope, compressing the payload when its
/// serialized form exceeds `threshold` bytes.
pub fn encode_with_threshold(state: &State, ts: f64, threshold: usize) -> Envelope {
    let mut value = serde_json::to_value(state).expect("state serialization is infallible");
    let obj = value
        .as_object_mut()
        .expect("states serialize to objects");
    obj.remove("t");

    let raw = serde_json::to_string(&value).expect("value serialization is infallible");
    let (compressed, data) = if raw.len() > threshold {
        (true, Value::String(gzip_b64(raw.as_bytes())))
    } else {
        (false, value)
    };

    Envelope {
        v: state.version(),
        t: state.tag().to_string(),
        ts,
        compressed,
        data,
    }
}

/// Rebuild a state from its envelope.
///
/// Refuses envelopes whose version is newer than this runtime understands,
/// and envelopes with an unregistered variant tag.
pub fn decode(envelope: &Envelope) -> Result<State, CodecError> {
    let supported = supported_version(&envelope.t)
        .ok_or_else(|| CodecError::UnknownVariant(envelope.t.clone()))?;
    if envelope.v > supported {
        return Err(CodecError::IncompatibleVersion {
            variant: envelope.t.clone(),
            found: envelope.v,
            supported,
        });
    }

    let data: Value = if envelope.compressed {
        let b64 = envelope
            .data
            .as_str()
            .ok_or_else(|| CodecError::Corrupt("compressed payload is not a string".into()))?;
        let raw = gunzip_b64(b64)?;
        serde_json::from_slice(&raw)?
    } else {
        match &envelope.data {
            // Legacy envelopes carry the payload as a JSON-encoded string.
            Value::String(raw) => serde_json::from_str(raw)?,
            other => other.clone(),
        }
    };

    let mut obj = match data {
        Value::Object(map) => map,
        other => {
            return Err(CodecError::Corrupt(format!(
                "payload must be an object, got {other}"
            )))
        }
    };
    obj.insert("t".to_string(), Value::String(envelope.t.clone()));
    Ok(serde_json::from_value(Value::Object(obj))?)
}

fn gzip_b64(raw: &[u8]) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).expect("in-memory write cannot fail");
    let bytes = encoder.finish().expect("in-memory gzip cannot fail");
    BASE64_STANDARD.encode(bytes)
}

fn gunzip_b64(b64: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = BASE64_STANDARD
        .decode(b64)
        .map_err(|e| CodecError::Corrupt(format!("base64: {e}")))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Corrupt(format!("gzip: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::WaitKind;

    fn all_states() -> Vec<State> {
        let mut args = Map::new();
        args.insert("x".into(), json!(1));
        let mut result = Map::new();
        result.insert("status".into(), json!("ok"));
        vec![
            State::user("hi"),
            State::user_with_meta("hi", "reflection"),
            State::AssistantMessage {
                content: Some("hello".into()),
                tool_calls: Some(vec![json!({"id": "a"})]),
                meta: None,
            },
            State::ToolCall {
                id: "h1".into(),
                function_name: "echo".into(),
                arguments: args.clone(),
            },
            State::ToolResult {
                tool_call_id: "h1".into(),
                tool_name: "echo".into(),
                result: result.clone(),
                arguments: Some(args),
                reward: Some(1.0),
            },
            State::AgentCall {
                agent_id: "child".into(),
                message: "do X".into(),
            },
            State::AgentResult {
                correlation_id: "c1".into(),
                result,
                score: Some(0.5),
            },
            State::UserInputRequest { text: "name?".into() },
            State::UserResponse { text: "Ada".into() },
            State::Waiting {
                kind: WaitKind::Tool,
                deadline: 12.5,
                correlation_id: Some("h1".into()),
            },
            State::Finished,
        ]
    }

    #[test]
    fn round_trip_every_variant() {
        for state in all_states() {
            let env = encode(&state, 1.0);
            let back = decode(&env).unwrap();
            assert_eq!(back, state, "round trip failed for {}", state.tag());
        }
    }

    #[test]
    fn small_payloads_stay_uncompressed() {
        let env = encode(&State::user("hi"), 1.0);
        assert!(!env.compressed);
        assert!(env.data.is_object());
    }

    #[test]
    fn large_payloads_compress_and_round_trip() {
        let state = State::user("x".repeat(10_000));
        let env = encode(&state, 1.0);
        assert!(env.compressed);
        assert!(env.data.is_string());
        assert_eq!(decode(&env).unwrap(), state);
    }

    #[test]
    fn threshold_zero_compresses_everything() {
        let state = State::Finished;
        let env = encode_with_threshold(&state, 1.0, 0);
        assert!(env.compressed);
        assert_eq!(decode(&env).unwrap(), state);
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut env = encode(&State::user("hi"), 1.0);
        env.v = 9;
        match decode(&env) {
            Err(CodecError::IncompatibleVersion { found, supported, .. }) => {
                assert_eq!(found, 9);
                assert_eq!(supported, 1);
            }
            other => panic!("expected IncompatibleVersion, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut env = encode(&State::user("hi"), 1.0);
        env.t = "mystery".into();
        assert!(matches!(decode(&env), Err(CodecError::UnknownVariant(_))));
    }

    #[test]
    fn legacy_string_payload_is_accepted() {
        let env = Envelope {
            v: 1,
            t: "user_message".into(),
            ts: 1.0,
            compressed: false,
            data: json!("{\"text\":\"old\"}"),
        };
        assert_eq!(decode(&env).unwrap(), State::user("old"));
    }

    #[test]
    fn envelope_json_omits_compressed_flag_when_false() {
        let env = encode(&State::user("hi"), 1.0);
        let raw = serde_json::to_string(&env).unwrap();
        assert!(!raw.contains("compressed"));
    }
}
