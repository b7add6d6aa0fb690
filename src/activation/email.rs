/// Email Trigger Activator and address service
///
/// Each email-triggered flow owns one Trigger Record whose id is the local part of its
/// inbound address. Addresses are reserved with a conditional insert, so two concurrent
/// activations can never end up sharing one.

use crate::activation::ActivationOutcome;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Flow, FlowStatus, FlowStorage, EMAIL_TRIGGER};
use crate::inbound::normalize::extract_trigger_id;
use crate::inbound::storage::{TriggerRecord, TriggerSettings, TriggerStatus, TriggerStorage};
use anyhow::Result;
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use std::sync::Arc;

/// Trigger prop holding the generated (possibly still pending) address
pub const EMAIL_PROP: &str = "unique_email";
/// Candidates tried before falling back to a fully random id
pub const CANDIDATE_ATTEMPTS: usize = 5;
const PREFIX_LEN: usize = 3;
const SUFFIX_LEN: usize = 2;
const FALLBACK_LEN: usize = 8;

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// First `PREFIX_LEN` alphanumerics of `source`, topped up randomly when it is too short
fn prefix_of(source: &str) -> String {
    let mut prefix: String = source
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(PREFIX_LEN)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let missing = PREFIX_LEN - prefix.len();
    prefix.push_str(&random_alphanumeric(missing));
    prefix
}

/// `{user prefix}{flow prefix}{random}`
pub fn candidate_id(user_id: &str, flow_id: &str) -> String {
    format!("{}{}{}", prefix_of(user_id), prefix_of(flow_id), random_alphanumeric(SUFFIX_LEN))
}

pub fn fallback_id() -> String {
    random_alphanumeric(FALLBACK_LEN)
}

pub struct EmailTriggerService {
    flows: FlowStorage,
    triggers: TriggerStorage,
    config: Arc<Config>,
}

impl EmailTriggerService {
    pub fn new(flows: FlowStorage, triggers: TriggerStorage, config: Arc<Config>) -> Self {
        Self { flows, triggers, config }
    }

    fn address_for(&self, id: &str) -> String {
        format!("{}@{}", id, self.config.email.domain)
    }

    /// Find an id no Trigger Record uses yet
    async fn free_trigger_id(&self, user_id: &str, flow_id: &str) -> Result<String> {
        for attempt in 1..=CANDIDATE_ATTEMPTS {
            let id = candidate_id(user_id, flow_id);
            if !self.triggers.address_in_use(&self.address_for(&id), &id).await? {
                return Ok(id);
            }
            tracing::debug!("🔁 Address candidate {} taken (attempt {})", id, attempt);
        }
        let id = fallback_id();
        tracing::warn!("⚠️ Candidate addresses exhausted for flow {}, using {}", flow_id, id);
        Ok(id)
    }

    /// The pending address stored on the trigger, if it is still free to claim
    async fn pending_trigger_id(&self, flow: &Flow) -> Result<Option<String>> {
        let Some(pending) = flow.trigger.as_ref().and_then(|t| t.prop_str(EMAIL_PROP)) else {
            return Ok(None);
        };
        let Some(id) = extract_trigger_id(pending, &self.config.email.domain) else {
            return Ok(None);
        };
        if self.triggers.address_in_use(&self.address_for(&id), &id).await? {
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Address for a flow before (or after) activation. Repeated calls return the same one.
    pub async fn generate_email_address(&self, flow: &Flow) -> EngineResult<String> {
        if let Some(record) = self.triggers.get_by_flow(&flow.id).await? {
            return Ok(record.unique_email);
        }
        if let Some(id) = self.pending_trigger_id(flow).await? {
            return Ok(self.address_for(&id));
        }

        let id = self.free_trigger_id(&flow.creator_id, &flow.id).await?;
        let address = self.address_for(&id);
        self.flows.set_trigger_prop(&flow.id, EMAIL_PROP, json!(address)).await?;
        tracing::info!("📧 Generated address {} for flow {}", address, flow.id);
        Ok(address)
    }

    pub async fn activate(&self, flow: &Flow) -> EngineResult<ActivationOutcome> {
        if let Some(record) = self.triggers.get_by_flow(&flow.id).await? {
            return self.reuse(flow, record).await;
        }

        let settings = match flow.trigger.as_ref().and_then(|t| t.props.get("settings")) {
            Some(value) if !value.is_null() => serde_json::from_value::<TriggerSettings>(value.clone())
                .map_err(|e| EngineError::InvalidArgument(format!("Invalid trigger settings: {}", e)))?,
            _ => TriggerSettings::default(),
        };
        settings.validate().map_err(EngineError::InvalidArgument)?;

        let mut id = match self.pending_trigger_id(flow).await? {
            Some(id) => id,
            None => self.free_trigger_id(&flow.creator_id, &flow.id).await?,
        };

        for _ in 0..=CANDIDATE_ATTEMPTS {
            let now = Utc::now();
            let record = TriggerRecord {
                id: id.clone(),
                flow_id: flow.id.clone(),
                creator_id: flow.creator_id.clone(),
                unique_email: self.address_for(&id),
                status: TriggerStatus::Active,
                settings: settings.clone(),
                trigger_count: 0,
                last_triggered: None,
                created_at: now,
                updated_at: now,
            };

            if self.triggers.insert_if_absent(&record).await? {
                self.flows
                    .set_trigger_prop(&flow.id, EMAIL_PROP, json!(record.unique_email))
                    .await?;
                self.flows.set_status(&flow.id, FlowStatus::Active).await?;
                tracing::info!("📬 Email trigger {} created for flow {}", record.unique_email, flow.id);
                return Ok(outcome_for(&record, false));
            }

            // Lost a race: either this flow already got a record, or the address clashed
            if let Some(winner) = self.triggers.get_by_flow(&flow.id).await? {
                return self.reuse(flow, winner).await;
            }
            id = self.free_trigger_id(&flow.creator_id, &flow.id).await?;
        }

        Err(EngineError::Internal(format!(
            "Could not reserve an inbound address for flow {}",
            flow.id
        )))
    }

    /// Existing record: reactivate when inactive, return as-is when active
    async fn reuse(&self, flow: &Flow, record: TriggerRecord) -> EngineResult<ActivationOutcome> {
        match record.status {
            TriggerStatus::Suspended => Err(EngineError::FailedPrecondition(format!(
                "Email trigger {} is suspended",
                record.unique_email
            ))),
            TriggerStatus::Active => {
                if !flow.is_active() {
                    self.flows.set_status(&flow.id, FlowStatus::Active).await?;
                }
                tracing::debug!("📬 Email trigger {} already active", record.unique_email);
                Ok(outcome_for(&record, false))
            }
            TriggerStatus::Inactive => {
                self.triggers.set_status(&record.id, TriggerStatus::Active).await?;
                self.flows.set_status(&flow.id, FlowStatus::Active).await?;
                tracing::info!("♻️ Email trigger {} reactivated for flow {}", record.unique_email, flow.id);
                Ok(outcome_for(&record, true))
            }
        }
    }

    /// Stop accepting mail for the flow; the address stays reserved for reactivation
    pub async fn deactivate(&self, flow: &Flow) -> EngineResult<()> {
        if let Some(record) = self.triggers.get_by_flow(&flow.id).await? {
            if record.status == TriggerStatus::Active {
                self.triggers.set_status(&record.id, TriggerStatus::Inactive).await?;
                tracing::info!("📪 Email trigger {} deactivated", record.unique_email);
            }
        }
        Ok(())
    }
}

fn outcome_for(record: &TriggerRecord, reactivated: bool) -> ActivationOutcome {
    ActivationOutcome {
        unique_email: Some(record.unique_email.clone()),
        trigger_id: Some(record.id.clone()),
        reactivated: Some(reactivated),
        ..ActivationOutcome::new(EMAIL_TRIGGER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_follow_the_address_format() {
        let id = candidate_id("User_42-abc", "Flow-XYZ-9");
        assert_eq!(id.len(), 8);
        assert!(id.starts_with("use"));
        assert_eq!(&id[3..6], "flo");
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn short_ids_are_padded() {
        let id = candidate_id("u", "--");
        assert_eq!(id.len(), 8);
        assert!(id.starts_with('u'));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fallback_is_eight_lowercase_alphanumerics() {
        let id = fallback_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
