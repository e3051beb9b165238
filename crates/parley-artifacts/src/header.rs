// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mint a fresh artifact ref: 32 lowercase hex chars, globally unique.
pub fn generate_ref() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Index record for one artifact.
///
/// `ref_id` / `ts` / `step_idx` may be left empty on publish; the bus
/// assigns them.  `role` defaults to `"state"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactHeader {
    #[serde(rename = "ref", default)]
    pub ref_id: String,
    pub session_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub branch_id: String,
    #[serde(default)]
    pub episode_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    #[serde(default)]
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_idx: Option<u64>,
    #[serde(default)]
    pub parent_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

fn default_mime() -> String {
    "application/json".to_string()
}

impl ArtifactHeader {
    /// Minimal header for a state artifact on a branch.
    pub fn for_state(session_id: &str, agent_id: &str, branch_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            branch_id: branch_id.to_string(),
            role: "state".to_string(),
            mime: default_mime(),
            ..Self::default()
        }
    }
}
