// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Every field has a sensible default so an empty config file (or none at
/// all) yields a fully working engine.  Values merge across config layers;
/// later layers override earlier ones (see [`crate::load`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tick: TickConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub eval: EvalConfig,
}

/// Tick driver and session tick worker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    /// How often the driver scans the active-session set.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A tick older than this is logged as stalled (the barrier is never
    /// forced; per-state deadlines resolve the stall).
    #[serde(default = "default_tick_timeout_secs")]
    pub timeout_secs: u64,
    /// TTL of the per-conversation tick fence lock.
    #[serde(default = "default_fence_ttl_secs")]
    pub fence_ttl_secs: u64,
    /// Idle-round budget per (conversation, agent, branch) before the agent
    /// is force-finished, and the re-enqueue bound for a single tick chain.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// How many stack entries are rendered into the agent transcript.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_tick_timeout_secs(),
            fence_ttl_secs: default_fence_ttl_secs(),
            max_rounds: default_max_rounds(),
            history_window: default_history_window(),
        }
    }
}

/// Queue capacities and worker-pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_tick_workers")]
    pub tick_workers: usize,
    #[serde(default = "default_tool_workers")]
    pub tool_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            tick_workers: default_tick_workers(),
            tool_workers: default_tool_workers(),
        }
    }
}

/// Deadlines for asynchronous edges (tools, delegation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Soft deadline written into tool `Waiting` frames, and the hard
    /// execution timeout for the tool worker.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_secs: u64,
    /// Lower bound for the delegation deadline — a child agent always gets
    /// at least this long to answer.
    #[serde(default = "default_min_agent_response_secs")]
    pub min_agent_response_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tool_secs: default_tool_timeout_secs(),
            min_agent_response_secs: default_min_agent_response_secs(),
        }
    }
}

/// Interaction-stack limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Branches are left-trimmed past this many entries.
    #[serde(default = "default_max_stack_len")]
    pub max_len: usize,
    /// TTL applied to every branch key and auxiliary pointer, refreshed on
    /// each mutation.
    #[serde(default = "default_key_ttl_secs")]
    pub key_ttl_secs: u64,
    /// Envelope payloads above this many bytes are gzip-compressed.
    #[serde(default = "default_gzip_threshold")]
    pub gzip_threshold: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_stack_len(),
            key_ttl_secs: default_key_ttl_secs(),
            gzip_threshold: default_gzip_threshold(),
        }
    }
}

/// Artifact bus limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Base directory for the filesystem storage driver.
    #[serde(default = "default_artifact_base_dir")]
    pub base_dir: String,
    /// Timelines above this size are pruned oldest-first.
    #[serde(default = "default_max_artifacts")]
    pub max_per_session: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            base_dir: default_artifact_base_dir(),
            max_per_session: default_max_artifacts(),
        }
    }
}

/// Which duplicate-tool-call policy the effect executor applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupPolicyKind {
    /// Always admit.
    None,
    /// Admit, but record the duplicate.
    Penalty,
    /// Reject duplicates unless the tool is side-effect free.
    #[default]
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub policy: DedupPolicyKind,
    /// Fallback TTL for dedup keys when the tool declares none.
    #[serde(default = "default_key_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            policy: DedupPolicyKind::default(),
            ttl_secs: default_key_ttl_secs(),
        }
    }
}

/// Self-critique limits for agents that opt into reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_max_reflections")]
    pub max_reflections: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_reflections: default_max_reflections(),
        }
    }
}

/// Auto-evaluation of finished branches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Judge scheduled against the final assistant artifact of every
    /// finished branch.  `None` disables auto-evaluation.
    #[serde(default)]
    pub judge_id: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_tick_timeout_secs() -> u64 {
    60
}

fn default_fence_ttl_secs() -> u64 {
    60
}

fn default_max_rounds() -> u32 {
    8
}

fn default_history_window() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_tick_workers() -> usize {
    2
}

fn default_tool_workers() -> usize {
    4
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_min_agent_response_secs() -> u64 {
    300
}

fn default_max_stack_len() -> usize {
    1_000
}

fn default_key_ttl_secs() -> u64 {
    86_400
}

fn default_gzip_threshold() -> usize {
    2_048
}

fn default_artifact_base_dir() -> String {
    ".parley".to_string()
}

fn default_max_artifacts() -> usize {
    100_000
}

fn default_max_reflections() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.tick.timeout_secs, 60);
        assert_eq!(cfg.tick.fence_ttl_secs, 60);
        assert_eq!(cfg.stack.gzip_threshold, 2_048);
        assert_eq!(cfg.stack.key_ttl_secs, 86_400);
        assert_eq!(cfg.artifacts.max_per_session, 100_000);
        assert_eq!(cfg.dedup.policy, DedupPolicyKind::Strict);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.tick.max_rounds, Config::default().tick.max_rounds);
        assert!(cfg.eval.judge_id.is_none());
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg: Config = serde_yaml::from_str("tick:\n  timeout_secs: 5\n").unwrap();
        assert_eq!(cfg.tick.timeout_secs, 5);
        assert_eq!(cfg.tick.fence_ttl_secs, 60);
    }

    #[test]
    fn dedup_policy_parses_lowercase() {
        let cfg: Config = serde_yaml::from_str("dedup:\n  policy: penalty\n").unwrap();
        assert_eq!(cfg.dedup.policy, DedupPolicyKind::Penalty);
    }
}
