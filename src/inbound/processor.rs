/// Inbound Email Webhook Processor
///
/// For every recipient addressed to a trigger (`{triggerId}@{domain}`) of a normalized
/// email: resolve the Trigger Record, apply filters and rate limits, check the owning
/// flow, then enqueue an execution through the Job Scheduler. Recipients are handled
/// independently and every outcome is written to the inbound log.

use crate::config::Config;
use crate::flow::FlowStorage;
use crate::inbound::normalize::{
    extract_trigger_id, is_test_email, normalize, to_trigger_input, InboundEmail, NormalizeError,
};
use crate::inbound::rate_limit::{RateDecision, RateLimiter};
use crate::inbound::storage::{InboundLogEntry, InboundLogStorage, InboundStatus, TriggerStatus, TriggerStorage};
use crate::runtime::orchestrator::ExecutionRequest;
use crate::scheduler::{DispatchRequest, JobScheduler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub const TRIGGER_NOT_FOUND: &str = "TRIGGER_NOT_FOUND";
pub const TRIGGER_INACTIVE: &str = "TRIGGER_INACTIVE";
pub const FLOW_INACTIVE: &str = "FLOW_INACTIVE";
pub const FLOW_NOT_FOUND: &str = "FLOW_NOT_FOUND";
pub const SENDER_NOT_ALLOWED: &str = "SENDER_NOT_ALLOWED";
pub const ATTACHMENT_TOO_LARGE: &str = "ATTACHMENT_TOO_LARGE";
pub const ATTACHMENT_TYPE_NOT_ALLOWED: &str = "ATTACHMENT_TYPE_NOT_ALLOWED";
pub const ENQUEUE_FAILED: &str = "ENQUEUE_FAILED";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const TEST_EMAIL: &str = "TEST_EMAIL";

/// Outcome for one addressed trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientResult {
    pub trigger_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub status: InboundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub processed_triggers: usize,
    pub results: Vec<RecipientResult>,
}

pub struct InboundEmailProcessor {
    triggers: TriggerStorage,
    logs: InboundLogStorage,
    flows: FlowStorage,
    limiter: RateLimiter,
    scheduler: Arc<dyn JobScheduler>,
    config: Arc<Config>,
}

impl InboundEmailProcessor {
    pub fn new(
        triggers: TriggerStorage,
        logs: InboundLogStorage,
        flows: FlowStorage,
        scheduler: Arc<dyn JobScheduler>,
        config: Arc<Config>,
    ) -> Self {
        let limiter = RateLimiter::new(logs.clone());
        Self { triggers, logs, flows, limiter, scheduler, config }
    }

    /// Process one webhook delivery. Only a payload that cannot be normalized is an error.
    pub async fn process(&self, payload: &Value) -> Result<WebhookResponse, NormalizeError> {
        let email = normalize(payload)?;
        self.process_email(&email, Utc::now()).await
    }

    pub async fn process_email(&self, email: &InboundEmail, now: DateTime<Utc>) -> Result<WebhookResponse, NormalizeError> {
        tracing::info!(
            "📥 Inbound email {} from {} to {} recipient(s)",
            email.message_id,
            email.from_address,
            email.recipients().len()
        );

        let mut results: Vec<RecipientResult> = Vec::new();
        for address in email.recipients() {
            let Some(trigger_id) = extract_trigger_id(&address, &self.config.email.domain) else {
                tracing::debug!("⏭️ Skipping non-trigger recipient: {}", address);
                continue;
            };
            if results.iter().any(|r| r.trigger_id == trigger_id) {
                continue;
            }
            results.push(self.process_recipient(email, &trigger_id, now).await);
        }

        if !results.is_empty() {
            self.limiter.spawn_cleanup();
        }

        let processed_triggers = results
            .iter()
            .filter(|r| r.status == InboundStatus::Processed)
            .count();
        tracing::info!(
            "📤 Inbound email {}: {}/{} trigger(s) processed",
            email.message_id,
            processed_triggers,
            results.len()
        );

        Ok(WebhookResponse { success: true, processed_triggers, results })
    }

    async fn process_recipient(&self, email: &InboundEmail, trigger_id: &str, now: DateTime<Utc>) -> RecipientResult {
        if is_test_email(email) {
            tracing::info!("🧪 Test email for trigger {}, not executing", trigger_id);
            return self
                .outcome(email, trigger_id, None, None, InboundStatus::Testing, Some(TEST_EMAIL), now)
                .await;
        }

        let record = match self.triggers.get(trigger_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!("❌ No trigger record for {}", trigger_id);
                return self
                    .outcome(email, trigger_id, None, None, InboundStatus::Failed, Some(TRIGGER_NOT_FOUND), now)
                    .await;
            }
            Err(e) => return self.internal_failure(email, trigger_id, None, e, now).await,
        };
        let flow_id = Some(record.flow_id.clone());

        if record.status != TriggerStatus::Active {
            return self
                .outcome(email, trigger_id, flow_id, None, InboundStatus::Filtered, Some(TRIGGER_INACTIVE), now)
                .await;
        }
        if !record.settings.accepts_sender(&email.from_address) {
            return self
                .outcome(email, trigger_id, flow_id, None, InboundStatus::Filtered, Some(SENDER_NOT_ALLOWED), now)
                .await;
        }
        let max_bytes = record.settings.max_attachment_size_mb as u64 * 1024 * 1024;
        if email.largest_attachment() > max_bytes {
            return self
                .outcome(email, trigger_id, flow_id, None, InboundStatus::Filtered, Some(ATTACHMENT_TOO_LARGE), now)
                .await;
        }
        if let Some(rejected) = email
            .attachments
            .iter()
            .find(|a| !record.settings.accepts_attachment(&a.filename, &a.content_type))
        {
            tracing::debug!(
                "📎 Attachment '{}' ({}) not accepted by trigger {}",
                rejected.filename,
                rejected.content_type,
                trigger_id
            );
            return self
                .outcome(email, trigger_id, flow_id, None, InboundStatus::Filtered, Some(ATTACHMENT_TYPE_NOT_ALLOWED), now)
                .await;
        }

        // The processed log entry doubles as the rate-limit reservation
        let execution_id = Uuid::new_v4().to_string();
        let reservation = log_entry(
            email,
            trigger_id,
            flow_id.clone(),
            Some(execution_id.clone()),
            InboundStatus::Processed,
            None,
            now,
        );
        match self.limiter.reserve(&reservation, &record.settings, now).await {
            Ok(RateDecision::Allowed { .. }) => {}
            Ok(RateDecision::Denied { reason }) => {
                return self
                    .outcome(email, trigger_id, flow_id, None, InboundStatus::Filtered, Some(reason), now)
                    .await;
            }
            Err(e) => return self.internal_failure(email, trigger_id, flow_id, e, now).await,
        }

        let flow = match self.flows.get_flow(&record.flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => return self.settle(reservation, InboundStatus::Failed, FLOW_NOT_FOUND).await,
            Err(e) => {
                tracing::error!("❌ Inbound email for trigger {} failed: {:#}", trigger_id, e);
                return self.settle(reservation, InboundStatus::Failed, INTERNAL_ERROR).await;
            }
        };
        if !flow.is_active() {
            return self.settle(reservation, InboundStatus::Filtered, FLOW_INACTIVE).await;
        }

        let body = ExecutionRequest {
            flow_id: flow.id.clone(),
            user_id: flow.creator_id.clone(),
            execution_id: Some(execution_id.clone()),
            trigger_input: to_trigger_input(email, trigger_id, now),
        };
        let body = match serde_json::to_value(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("❌ Inbound email for trigger {} failed: {:#}", trigger_id, e);
                return self.settle(reservation, InboundStatus::Failed, INTERNAL_ERROR).await;
            }
        };

        let dispatch = DispatchRequest {
            destination: self.config.execution_url(),
            body,
            not_before: None,
            retries: self.config.scheduler.retries,
            failure_callback: Some(self.config.failure_callback_url()),
        };
        if let Err(e) = self.scheduler.publish(dispatch).await {
            tracing::error!("❌ Failed to enqueue flow {} for trigger {}: {:#}", flow.id, trigger_id, e);
            return self.settle(reservation, InboundStatus::Failed, ENQUEUE_FAILED).await;
        }

        if let Err(e) = self.triggers.record_firing(trigger_id, now).await {
            tracing::warn!("⚠️ Failed to bump counters for trigger {}: {:#}", trigger_id, e);
        }

        tracing::info!("🚀 Enqueued flow {} (run {}) from trigger {}", flow.id, execution_id, trigger_id);
        report(reservation)
    }

    async fn internal_failure(
        &self,
        email: &InboundEmail,
        trigger_id: &str,
        flow_id: Option<String>,
        error: anyhow::Error,
        now: DateTime<Utc>,
    ) -> RecipientResult {
        tracing::error!("❌ Inbound email for trigger {} failed: {:#}", trigger_id, error);
        self.outcome(email, trigger_id, flow_id, None, InboundStatus::Failed, Some(INTERNAL_ERROR), now)
            .await
    }

    /// Log the outcome, then report it
    #[allow(clippy::too_many_arguments)]
    async fn outcome(
        &self,
        email: &InboundEmail,
        trigger_id: &str,
        flow_id: Option<String>,
        execution_id: Option<String>,
        status: InboundStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> RecipientResult {
        let entry = log_entry(email, trigger_id, flow_id, execution_id, status, reason, now);
        if let Err(e) = self.logs.append(&entry).await {
            tracing::error!("❌ Failed to write inbound log for trigger {}: {:#}", trigger_id, e);
        }
        report(entry)
    }

    /// Give up a reserved firing, recording why it did not run
    async fn settle(&self, mut reservation: InboundLogEntry, status: InboundStatus, reason: &str) -> RecipientResult {
        if let Err(e) = self.logs.set_outcome(&reservation.id, status, Some(reason)).await {
            tracing::error!("❌ Failed to release reservation for trigger {}: {:#}", reservation.trigger_id, e);
        }
        reservation.status = status;
        reservation.reason = Some(reason.to_string());
        reservation.execution_id = None;
        report(reservation)
    }
}

fn log_entry(
    email: &InboundEmail,
    trigger_id: &str,
    flow_id: Option<String>,
    execution_id: Option<String>,
    status: InboundStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> InboundLogEntry {
    InboundLogEntry {
        id: Uuid::new_v4().to_string(),
        trigger_id: trigger_id.to_string(),
        flow_id,
        execution_id,
        message_id: Some(email.message_id.clone()).filter(|m| !m.is_empty()),
        from_address: Some(email.from_address.clone()),
        subject: Some(email.subject.clone()),
        status,
        reason: reason.map(str::to_string),
        received_at: now.timestamp_millis(),
    }
}

fn report(entry: InboundLogEntry) -> RecipientResult {
    if entry.status == InboundStatus::Filtered {
        tracing::info!("🚫 Trigger {} filtered: {}", entry.trigger_id, entry.reason.as_deref().unwrap_or_default());
    }
    RecipientResult {
        trigger_id: entry.trigger_id,
        flow_id: entry.flow_id,
        execution_id: entry.execution_id,
        status: entry.status,
        reason: entry.reason,
    }
}
