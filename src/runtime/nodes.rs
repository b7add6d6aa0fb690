/// Built-in node implementations
///
/// - Trigger nodes surface the fired event to later steps
/// - HttpRequestNode: external API calls (the only generic action node shipped here)
///
/// Every other action node (calendar, mail, tables, ...) lives outside the engine and is
/// added through `NodeRegistry::register`.

use crate::runtime::registry::{PriorResults, RunContext, StepExecutor};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Absolute-time trigger: reports when it fired and what it was armed for
pub struct ScheduleTriggerNode;

#[async_trait]
impl StepExecutor for ScheduleTriggerNode {
    fn name(&self) -> &str {
        "Scheduled time"
    }

    async fn run(&self, ctx: &RunContext, config: &Map<String, Value>, _prior: &PriorResults) -> Result<Value> {
        Ok(json!({
            "success": true,
            "triggeredAt": ctx.started_at.to_rfc3339(),
            "date": config.get("date").cloned().unwrap_or(Value::Null),
            "time": config.get("time").cloned().unwrap_or(Value::Null),
            "timezone": config.get("timezone").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Recurring-interval trigger
pub struct IntervalTriggerNode;

#[async_trait]
impl StepExecutor for IntervalTriggerNode {
    fn name(&self) -> &str {
        "Recurring schedule"
    }

    async fn run(&self, ctx: &RunContext, config: &Map<String, Value>, _prior: &PriorResults) -> Result<Value> {
        Ok(json!({
            "success": true,
            "triggeredAt": ctx.started_at.to_rfc3339(),
            "cron": config.get("cron").cloned().unwrap_or(Value::Null),
            "timezone": config.get("timezone").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Inbound-email trigger: exposes the normalized email to later steps
pub struct EmailTriggerNode;

#[async_trait]
impl StepExecutor for EmailTriggerNode {
    fn name(&self) -> &str {
        "Inbound email"
    }

    async fn run(&self, ctx: &RunContext, config: &Map<String, Value>, _prior: &PriorResults) -> Result<Value> {
        let email = ctx.trigger_input.get("email").cloned().unwrap_or(Value::Null);
        if email.is_null() {
            // Manual/test runs carry no email
            tracing::debug!("📭 Email trigger ran without an inbound email: {}", ctx.execution_id);
        }

        Ok(json!({
            "success": true,
            "triggeredAt": ctx.started_at.to_rfc3339(),
            "address": config.get("unique_email").cloned().unwrap_or(Value::Null),
            "triggerId": ctx.trigger_input.get("triggerId").cloned().unwrap_or(Value::Null),
            "email": email,
        }))
    }
}

/// HTTP client for external API calls
///
/// Expected props: { "url": "https://api.example.com/data", "method": "POST", "headers": {...}, "body": {...} }
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub const NODE_ID: &'static str = "http-request";

    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for HttpRequestNode {
    fn name(&self) -> &str {
        "HTTP request"
    }

    async fn run(&self, ctx: &RunContext, config: &Map<String, Value>, _prior: &PriorResults) -> Result<Value> {
        let url = config
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| anyhow::anyhow!("http-request missing 'url' parameter"))?;

        let method = config.get("method").and_then(|m| m.as_str()).unwrap_or("GET");

        tracing::debug!("🌍 HTTP Request: {} {} (run {})", method, url, ctx.execution_id);

        let mut request_builder = match method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            _ => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method)),
        };

        if let Some(headers) = config.get("headers").and_then(|h| h.as_object()) {
            for (key, value) in headers {
                if let Some(header_value) = value.as_str() {
                    request_builder = request_builder.header(key.as_str(), header_value);
                }
            }
        }

        if let Some(body) = config.get("body") {
            request_builder = match body {
                Value::String(text) => request_builder
                    .header("Content-Type", "text/plain")
                    .body(text.clone()),
                other => request_builder.json(other),
            };
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        let headers_map: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let response_text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&response_text).unwrap_or(Value::String(response_text));

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);

        let mut result = json!({
            "success": status.is_success(),
            "status": status.as_u16(),
            "headers": headers_map,
            "data": data,
        });
        if !status.is_success() {
            result["error"] = json!(format!("{} {} returned {}", method, url, status));
        }
        Ok(result)
    }
}
