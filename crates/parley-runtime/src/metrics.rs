// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use tracing::info;

/// Counter/gauge sink.  The engine emits low-cardinality events
/// (`effect_executed`, `duplicate_tool_call`, `tick_started`, …); sinks
/// decide where they go.
pub trait Metrics: Send + Sync {
    fn emit(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Default sink: structured `tracing` events under the `metrics` target.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn emit(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        info!(target: "metrics", metric = name, value, ?tags);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

impl MetricEvent {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Test sink that records every emission.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .count()
    }

    pub fn find_with_tag(&self, name: &str, key: &str, value: &str) -> Option<MetricEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name && e.tag(key) == Some(value))
            .cloned()
    }
}

impl Metrics for RecordingMetrics {
    fn emit(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.events.lock().unwrap().push(MetricEvent {
            name: name.to_string(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts_and_filters() {
        let m = RecordingMetrics::default();
        m.emit("tick_started", 1.0, &[("conversation_id", "c1")]);
        m.emit("tick_started", 1.0, &[("conversation_id", "c2")]);
        m.emit("effect_executed", 1.0, &[]);
        assert_eq!(m.count("tick_started"), 2);
        let hit = m
            .find_with_tag("tick_started", "conversation_id", "c2")
            .unwrap();
        assert_eq!(hit.value, 1.0);
        assert!(m.find_with_tag("tick_started", "conversation_id", "c9").is_none());
    }
}
