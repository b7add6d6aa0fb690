/// Core flow type definitions
///
/// A flow is one trigger plus an ordered list of action steps. Flows are stored as
/// JSON documents; activation mutates `status`/`schedule`, execution only reads them
/// (and self-disarms one-shot time triggers).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Registry key of the absolute-time trigger node
pub const SCHEDULE_TRIGGER: &str = "schedule-trigger";
/// Registry key of the recurring-interval trigger node
pub const INTERVAL_TRIGGER: &str = "interval-trigger";
/// Registry key of the inbound-email trigger node
pub const EMAIL_TRIGGER: &str = "email-trigger";

/// A complete flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Unique flow identifier
    pub id: String,
    /// Human-readable flow name
    #[serde(default)]
    pub name: String,
    /// Owning user; only the creator may activate or edit the flow
    pub creator_id: String,
    #[serde(default)]
    pub status: FlowStatus,
    /// The event that fires this flow
    #[serde(default)]
    pub trigger: Option<NodeSpec>,
    /// Action steps, executed strictly in array order
    #[serde(default)]
    pub steps: Vec<NodeSpec>,
    /// Registered schedule, present while a time trigger is armed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleMeta>,
}

/// Trigger or step configuration: which registry node to run and its props
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: String,
    #[serde(rename = "propsData", default)]
    pub props: Map<String, Value>,
}

pub type TriggerSpec = NodeSpec;

impl NodeSpec {
    pub fn new(node_id: impl Into<String>, props: Value) -> Self {
        let props = match props {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { node_id: node_id.into(), props }
    }

    /// String prop, ignoring blanks
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Display name: explicit `name` prop, else the node id
    pub fn display_name(&self) -> String {
        self.prop_str("name").unwrap_or(&self.node_id).to_string()
    }
}

/// Flow lifecycle status, persisted as `0`/`1`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
}

impl From<FlowStatus> for u8 {
    fn from(status: FlowStatus) -> u8 {
        match status {
            FlowStatus::Draft => 0,
            FlowStatus::Active => 1,
        }
    }
}

impl TryFrom<u8> for FlowStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FlowStatus::Draft),
            1 => Ok(FlowStatus::Active),
            other => Err(format!("invalid flow status: {}", other)),
        }
    }
}

/// Schedule metadata persisted on an armed flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMeta {
    /// Recurring registration id
    #[serde(rename = "scheduleId", default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    /// One-shot dispatch id
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Cron as authored (local time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Cron actually registered (UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(rename = "scheduledFor", default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Closed set of trigger types the activation manager knows how to arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    AbsoluteTime,
    RecurringInterval,
    InboundEmail,
}

impl TriggerKind {
    pub fn from_node_id(node_id: &str) -> Option<Self> {
        match node_id {
            SCHEDULE_TRIGGER => Some(TriggerKind::AbsoluteTime),
            INTERVAL_TRIGGER => Some(TriggerKind::RecurringInterval),
            EMAIL_TRIGGER => Some(TriggerKind::InboundEmail),
            _ => None,
        }
    }
}

impl Flow {
    pub fn trigger_kind(&self) -> Option<TriggerKind> {
        self.trigger
            .as_ref()
            .and_then(|t| TriggerKind::from_node_id(&t.node_id))
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }
}
