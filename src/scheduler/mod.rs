/// Job Scheduler contract
///
/// The engine never runs timers itself: it hands a destination URL and a JSON body to
/// a durable at-least-once dispatcher, either for one delivery at a future instant or
/// on a cron cadence. Two backends are provided:
/// - `LocalJobScheduler`: in-process, on tokio-cron-scheduler
/// - `HttpJobScheduler`: remote QStash-compatible HTTP API

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

// In-process dispatcher built on tokio-cron-scheduler
pub mod local;

// Remote dispatcher over HTTP
pub mod http;

pub use http::HttpJobScheduler;
pub use local::LocalJobScheduler;

/// One-shot delivery request
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub destination: String,
    pub body: Value,
    /// Deliver no earlier than this UTC epoch second; `None` means now
    pub not_before: Option<i64>,
    pub retries: u32,
    pub failure_callback: Option<String>,
}

/// Recurring delivery request
#[derive(Debug, Clone, PartialEq)]
pub struct CronRequest {
    pub destination: String,
    /// Five-field cron, evaluated in UTC
    pub cron: String,
    pub body: Value,
    pub retries: u32,
    pub failure_callback: Option<String>,
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Register a one-shot delivery, returning its message id
    async fn publish(&self, request: DispatchRequest) -> Result<String>;

    /// Register a recurring delivery, returning its schedule id
    async fn schedule(&self, request: CronRequest) -> Result<String>;

    /// Cancel a pending message or schedule. Unknown ids are not an error.
    async fn cancel(&self, id: &str) -> Result<()>;
}

/// POST `body` to `destination`, retrying `retries` times, then notify the failure callback.
///
/// Shared by the in-process backend; the remote backend delegates this to the service.
pub(crate) async fn deliver(
    client: &reqwest::Client,
    destination: &str,
    body: &Value,
    retries: u32,
    failure_callback: Option<&str>,
) {
    let attempts = retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match client.post(destination).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("📬 Delivered job to {} (attempt {})", destination, attempt);
                return;
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                last_error = format!("{}: {}", status, text);
            }
            Err(e) => last_error = e.to_string(),
        }

        tracing::warn!(
            "⚠️ Job delivery to {} failed (attempt {}/{}): {}",
            destination,
            attempt,
            attempts,
            last_error
        );
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }
    }

    let Some(callback) = failure_callback else {
        tracing::error!("❌ Job delivery to {} exhausted retries: {}", destination, last_error);
        return;
    };

    let notice = serde_json::json!({
        "destination": destination,
        "body": body,
        "error": last_error,
    });
    if let Err(e) = client.post(callback).json(&notice).send().await {
        tracing::error!("❌ Failure callback {} unreachable: {}", callback, e);
    }
}
