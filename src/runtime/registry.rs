/// Node Registry
///
/// Fixed mapping from a trigger/step `node_id` to the unit that executes it. Built once
/// at startup and shared read-only by every run.

use crate::flow::types::{EMAIL_TRIGGER, INTERVAL_TRIGGER, SCHEDULE_TRIGGER};
use crate::runtime::nodes::{EmailTriggerNode, HttpRequestNode, IntervalTriggerNode, ScheduleTriggerNode};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

/// Accumulated results of the nodes that already ran, keyed by node label
pub type PriorResults = Map<String, Value>;

/// Request-scoped, immutable context handed to every node of one run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub flow_id: String,
    /// Caller identity the nodes act on behalf of
    pub user_id: String,
    pub execution_id: String,
    /// Event payload of the fired trigger (e.g. the normalized email); `Null` for timers
    pub trigger_input: Value,
    pub started_at: DateTime<Utc>,
}

/// Contract every trigger and action node satisfies.
///
/// A returned object with `"success": false` is a reported failure and stops the run;
/// an `Err` is treated the same way, with the error text as the failure message.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Human-readable node name used in step logs
    fn name(&self) -> &str;

    async fn run(&self, ctx: &RunContext, config: &Map<String, Value>, prior: &PriorResults) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn StepExecutor>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.node_ids())
            .finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three trigger nodes and the built-in `http-request` action
    pub fn with_builtin_nodes() -> Self {
        let mut registry = Self::new();
        registry
            .register(SCHEDULE_TRIGGER, ScheduleTriggerNode)
            .register(INTERVAL_TRIGGER, IntervalTriggerNode)
            .register(EMAIL_TRIGGER, EmailTriggerNode)
            .register(HttpRequestNode::NODE_ID, HttpRequestNode::new());
        registry
    }

    /// Add or replace a node implementation
    pub fn register(&mut self, node_id: impl Into<String>, executor: impl StepExecutor + 'static) -> &mut Self {
        self.nodes.insert(node_id.into(), Arc::new(executor));
        self
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<dyn StepExecutor>> {
        self.nodes.get(node_id).cloned()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Whether a node result reports failure (`"success": false`)
pub fn is_failure(result: &Value) -> bool {
    matches!(result.get("success"), Some(Value::Bool(false)))
}

/// Error text a failed node reported, falling back to a generic message
pub fn failure_message(result: &Value) -> String {
    match result.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(Value::Null) | None => "Node reported failure".to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_covers_all_triggers() {
        let registry = NodeRegistry::with_builtin_nodes();
        for id in [SCHEDULE_TRIGGER, INTERVAL_TRIGGER, EMAIL_TRIGGER, "http-request"] {
            assert!(registry.get(id).is_some(), "missing {}", id);
        }
        assert!(registry.get("calendar-create").is_none());
    }

    #[test]
    fn only_explicit_false_is_failure() {
        assert!(is_failure(&json!({ "success": false })));
        assert!(!is_failure(&json!({ "success": true })));
        assert!(!is_failure(&json!({ "data": 1 })));
        assert!(!is_failure(&json!("text")));
    }

    #[test]
    fn failure_message_prefers_reported_error() {
        assert_eq!(failure_message(&json!({ "success": false, "error": "x" })), "x");
        assert_eq!(
            failure_message(&json!({ "success": false, "error": { "message": "quota" } })),
            "quota"
        );
        assert_eq!(failure_message(&json!({ "success": false })), "Node reported failure");
    }
}
