/// Trigger Activation Manager
///
/// Validates a flow on behalf of its creator and arms its trigger:
/// - `schedule-trigger`: one-shot dispatch at a local wall-clock instant
/// - `interval-trigger`: recurring cron registration
/// - `email-trigger`: inbound address backed by a Trigger Record
///
/// The manager never writes the flow itself; each activator persists its own state
/// once the external registration has succeeded.

// Absolute-time and recurring-interval activators, timezone math
pub mod schedule;

// Email trigger activator and unique-address service
pub mod email;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Flow, FlowStatus, FlowStorage, TriggerKind};
use crate::inbound::storage::TriggerStorage;
use crate::scheduler::JobScheduler;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub use email::EmailTriggerService;
pub use schedule::{convert_cron_to_utc, local_to_utc, ScheduleActivator};

/// What an activation armed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivationOutcome {
    pub success: bool,
    #[serde(rename = "triggerType")]
    pub trigger_type: String,
    #[serde(rename = "scheduleId", skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(rename = "scheduledFor", skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactivated: Option<bool>,
}

impl ActivationOutcome {
    pub fn new(trigger_type: &str) -> Self {
        Self {
            success: true,
            trigger_type: trigger_type.to_string(),
            ..Default::default()
        }
    }
}

pub struct ActivationManager {
    flows: FlowStorage,
    schedules: ScheduleActivator,
    email: EmailTriggerService,
}

impl ActivationManager {
    pub fn new(
        flows: FlowStorage,
        triggers: TriggerStorage,
        scheduler: Arc<dyn JobScheduler>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            schedules: ScheduleActivator::new(flows.clone(), scheduler, config.clone()),
            email: EmailTriggerService::new(flows.clone(), triggers, config),
            flows,
        }
    }

    /// Load a flow the caller owns
    async fn load_owned(&self, flow_id: &str, user_id: &str) -> EngineResult<Flow> {
        if flow_id.trim().is_empty() {
            return Err(EngineError::InvalidArgument("Flow id is required".to_string()));
        }
        let flow = self
            .flows
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Flow not found: {}", flow_id)))?;
        if flow.creator_id != user_id {
            return Err(EngineError::PermissionDenied(format!(
                "Only the creator may manage flow {}",
                flow_id
            )));
        }
        Ok(flow)
    }

    pub async fn activate(&self, flow_id: &str, user_id: &str) -> EngineResult<ActivationOutcome> {
        let flow = self.load_owned(flow_id, user_id).await?;
        let Some(trigger) = &flow.trigger else {
            return Err(EngineError::FailedPrecondition(format!("Flow {} has no trigger", flow_id)));
        };
        if flow.steps.is_empty() {
            return Err(EngineError::FailedPrecondition(format!("Flow {} has no steps", flow_id)));
        }

        tracing::info!("🔌 Activating flow {} ({})", flow.id, trigger.node_id);
        match flow.trigger_kind() {
            Some(TriggerKind::AbsoluteTime) => self.schedules.activate_absolute(&flow).await,
            Some(TriggerKind::RecurringInterval) => self.schedules.activate_recurring(&flow).await,
            Some(TriggerKind::InboundEmail) => self.email.activate(&flow).await,
            None => Err(EngineError::Unimplemented(format!(
                "Unsupported trigger type: {}",
                trigger.node_id
            ))),
        }
    }

    /// Disarm the trigger and return the flow to draft
    pub async fn deactivate(&self, flow_id: &str, user_id: &str) -> EngineResult<ActivationOutcome> {
        let flow = self.load_owned(flow_id, user_id).await?;
        let trigger_type = flow
            .trigger
            .as_ref()
            .map(|t| t.node_id.clone())
            .unwrap_or_default();

        match flow.trigger_kind() {
            Some(TriggerKind::AbsoluteTime) | Some(TriggerKind::RecurringInterval) => {
                self.schedules.deactivate(&flow).await?
            }
            Some(TriggerKind::InboundEmail) => self.email.deactivate(&flow).await?,
            None => {}
        }
        self.flows.set_activation(&flow.id, FlowStatus::Draft, None).await?;

        tracing::info!("⏹️ Flow {} deactivated", flow.id);
        Ok(ActivationOutcome::new(&trigger_type))
    }

    pub async fn generate_email_address(&self, flow_id: &str, user_id: &str) -> EngineResult<String> {
        let flow = self.load_owned(flow_id, user_id).await?;
        if flow.trigger_kind() != Some(TriggerKind::InboundEmail) {
            return Err(EngineError::FailedPrecondition(format!(
                "Flow {} does not use an email trigger",
                flow_id
            )));
        }
        self.email.generate_email_address(&flow).await
    }
}
