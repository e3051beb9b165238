// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use parley_store::Store;

/// Declarative knobs a tool exposes to the engine.
#[derive(Debug, Clone, Default)]
pub struct ToolConfig {
    /// Safe to repeat: the strict dedup policy admits duplicates.
    pub side_effect_free: bool,
    /// Dedup-key TTL override; falls back to the engine-wide default.
    pub dedup_ttl_secs: Option<u64>,
    /// After the result lands, prompt the agent to critique it.
    pub reflect: bool,
    /// Post-effect handlers run by the tool worker after the result is on
    /// the stack.
    pub post_effects: Vec<String>,
    /// Hard execution timeout override for the tool worker.
    pub timeout_secs: Option<u64>,
}

/// Everything a tool may touch while executing.
pub struct ToolContext<'a> {
    pub store: Arc<dyn Store>,
    pub conversation_id: &'a str,
    pub creator_id: &'a str,
    pub branch_id: &'a str,
}

/// A deterministic capability the engine can schedule.
///
/// The returned map may include `status`, `data`, `message` and
/// `cache_status`; anything else passes through into the result artifact.
/// Input validation is the tool's own responsibility.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> ToolConfig {
        ToolConfig::default()
    }

    async fn execute(
        &self,
        ctx: ToolContext<'_>,
        params: &Map<String, Value>,
    ) -> anyhow::Result<Map<String, Value>>;
}

/// Central registry holding all schedulable tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .unwrap()
            .insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn config(&self) -> ToolConfig {
            ToolConfig {
                side_effect_free: true,
                ..ToolConfig::default()
            }
        }

        async fn execute(
            &self,
            _ctx: ToolContext<'_>,
            params: &Map<String, Value>,
        ) -> anyhow::Result<Map<String, Value>> {
            let mut out = Map::new();
            out.insert("echo".into(), Value::Object(params.clone()));
            out
                .insert("status".into(), json!("ok"));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn registry_executes_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert_eq!(registry.names(), vec!["echo"]);

        let tool = registry.get("echo").unwrap();
        let store: Arc<dyn Store> = Arc::new(parley_store::MemoryStore::default());
        let ctx = ToolContext {
            store,
            conversation_id: "c1",
            creator_id: "a1",
            branch_id: "main",
        };
        let mut params = Map::new();
        params.insert("x".into(), json!(1));
        let out = tool.execute(ctx, &params).await.unwrap();
        assert_eq!(out["status"], json!("ok"));
        assert_eq!(out["echo"]["x"], json!(1));
        assert!(tool.config().side_effect_free);
    }

    #[test]
    fn unknown_tool_is_none() {
        let registry = ToolRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
