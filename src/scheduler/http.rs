/// Remote Job Scheduler over a QStash-compatible HTTP API
///
/// - one-shot: `POST {base}/v2/publish/{destination}` with `Upstash-Not-Before`
/// - recurring: `POST {base}/v2/schedules/{destination}` with `Upstash-Cron`
/// - cancel: `DELETE {base}/v2/schedules/{id}` or `DELETE {base}/v2/messages/{id}`

use crate::scheduler::{CronRequest, DispatchRequest, JobScheduler};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct HttpJobScheduler {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpJobScheduler {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request(
        &self,
        path: &str,
        body: &Value,
        retries: u32,
        failure_callback: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Upstash-Retries", retries.to_string())
            .json(body);
        if let Some(callback) = failure_callback {
            builder = builder.header("Upstash-Failure-Callback", callback);
        }
        builder
    }

    async fn send_for_id(&self, builder: reqwest::RequestBuilder, id_field: &str) -> Result<String> {
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Job scheduler unreachable: {}", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read job scheduler response: {}", e))?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("Job scheduler rejected request ({}): {}", status, text));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("Invalid job scheduler response: {}", e))?;
        json.get(id_field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Job scheduler response missing '{}'", id_field))
    }
}

#[async_trait]
impl JobScheduler for HttpJobScheduler {
    async fn publish(&self, request: DispatchRequest) -> Result<String> {
        let mut builder = self.request(
            &format!("/v2/publish/{}", request.destination),
            &request.body,
            request.retries,
            request.failure_callback.as_deref(),
        );
        if let Some(not_before) = request.not_before {
            builder = builder.header("Upstash-Not-Before", not_before.to_string());
        }

        let message_id = self.send_for_id(builder, "messageId").await?;
        tracing::info!("📨 Published message {} -> {}", message_id, request.destination);
        Ok(message_id)
    }

    async fn schedule(&self, request: CronRequest) -> Result<String> {
        let builder = self
            .request(
                &format!("/v2/schedules/{}", request.destination),
                &request.body,
                request.retries,
                request.failure_callback.as_deref(),
            )
            .header("Upstash-Cron", request.cron.as_str());

        let schedule_id = self.send_for_id(builder, "scheduleId").await?;
        tracing::info!("📅 Created schedule {} ({}) -> {}", schedule_id, request.cron, request.destination);
        Ok(schedule_id)
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let collection = if id.starts_with("scd_") { "schedules" } else { "messages" };
        let response = self
            .client
            .delete(format!("{}/v2/{}/{}", self.base_url, collection, id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Job scheduler unreachable: {}", e))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            tracing::info!("🛑 Cancelled {} {}", collection, id);
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(anyhow::anyhow!("Job scheduler refused cancel ({}): {}", status, text))
    }
}
