/// Trigger Records and inbound email logs
///
/// A Trigger Record is the persisted state of one flow's email trigger. `flow_id` and
/// `unique_email` are both UNIQUE, so creation is a conditional write: a lost race
/// shows up as "nothing inserted" instead of a duplicate record.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};

/// Attachment extensions a trigger may accept
pub const ALLOWED_ATTACHMENT_TYPES: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "csv", "txt", "png", "jpg", "jpeg", "gif", "zip",
];

pub const MAX_PER_HOUR_LIMIT: u32 = 1000;
pub const MAX_PER_DAY_LIMIT: u32 = 5000;
pub const MAX_ATTACHMENT_SIZE_MB_LIMIT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Active,
    Inactive,
    Suspended,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Active => "active",
            TriggerStatus::Inactive => "inactive",
            TriggerStatus::Suspended => "suspended",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(TriggerStatus::Active),
            "inactive" => Ok(TriggerStatus::Inactive),
            "suspended" => Ok(TriggerStatus::Suspended),
            other => Err(anyhow::anyhow!("Unknown trigger status: {}", other)),
        }
    }
}

/// Per-trigger limits and filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub max_per_hour: u32,
    pub max_per_day: u32,
    pub max_attachment_size_mb: u32,
    pub allowed_attachment_types: Vec<String>,
    /// Exact addresses or `@domain` suffixes; empty accepts any sender
    pub allowed_senders: Vec<String>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            max_per_hour: 100,
            max_per_day: 1000,
            max_attachment_size_mb: 25,
            allowed_attachment_types: ALLOWED_ATTACHMENT_TYPES.iter().map(|t| t.to_string()).collect(),
            allowed_senders: Vec::new(),
        }
    }
}

impl TriggerSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_per_hour == 0 || self.max_per_hour > MAX_PER_HOUR_LIMIT {
            return Err(format!("max_per_hour must be between 1 and {}", MAX_PER_HOUR_LIMIT));
        }
        if self.max_per_day == 0 || self.max_per_day > MAX_PER_DAY_LIMIT {
            return Err(format!("max_per_day must be between 1 and {}", MAX_PER_DAY_LIMIT));
        }
        if self.max_attachment_size_mb > MAX_ATTACHMENT_SIZE_MB_LIMIT {
            return Err(format!(
                "max_attachment_size_mb must be at most {}",
                MAX_ATTACHMENT_SIZE_MB_LIMIT
            ));
        }
        if let Some(bad) = self
            .allowed_attachment_types
            .iter()
            .find(|t| !ALLOWED_ATTACHMENT_TYPES.contains(&t.to_lowercase().as_str()))
        {
            return Err(format!("attachment type '{}' is not allowed", bad));
        }
        Ok(())
    }

    /// Whether an attachment's type passes the allow-list; empty accepts any type.
    ///
    /// The type is the filename extension, or the content-type subtype when the name has none.
    pub fn accepts_attachment(&self, filename: &str, content_type: &str) -> bool {
        if self.allowed_attachment_types.is_empty() {
            return true;
        }
        let Some(kind) = attachment_type(filename, content_type) else {
            return false;
        };
        self.allowed_attachment_types
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(&kind))
    }

    /// Whether `from` passes the sender allow-list
    pub fn accepts_sender(&self, from: &str) -> bool {
        if self.allowed_senders.is_empty() {
            return true;
        }
        let from = from.to_lowercase();
        self.allowed_senders.iter().any(|allowed| {
            let allowed = allowed.trim().to_lowercase();
            if allowed.starts_with('@') {
                from.ends_with(&allowed)
            } else {
                from == allowed
            }
        })
    }
}

fn attachment_type(filename: &str, content_type: &str) -> Option<String> {
    let extension = filename
        .trim()
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty());
    let subtype = content_type
        .split(';')
        .next()
        .and_then(|mime| mime.trim().split_once('/'))
        .map(|(_, sub)| sub)
        .filter(|sub| !sub.is_empty());
    extension.or(subtype).map(str::to_lowercase)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// Also the local part of `unique_email`
    pub id: String,
    pub flow_id: String,
    pub creator_id: String,
    pub unique_email: String,
    pub status: TriggerStatus,
    pub settings: TriggerSettings,
    pub trigger_count: i64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TriggerStorage {
    pool: SqlitePool,
}

const TRIGGER_COLUMNS: &str = "id, flow_id, creator_id, unique_email, status, settings, trigger_count, last_triggered, created_at, updated_at";

impl TriggerStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<Option<TriggerRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM email_triggers WHERE id = ?", TRIGGER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn get_by_flow(&self, flow_id: &str) -> Result<Option<TriggerRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM email_triggers WHERE flow_id = ?", TRIGGER_COLUMNS))
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Whether any Trigger Record already owns this address (or its id)
    pub async fn address_in_use(&self, unique_email: &str, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM email_triggers WHERE unique_email = ? OR id = ? LIMIT 1")
            .bind(unique_email)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Create-if-absent. Returns false when the flow or address is already taken.
    pub async fn insert_if_absent(&self, record: &TriggerRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_triggers
                (id, flow_id, creator_id, unique_email, status, settings, trigger_count, last_triggered, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.flow_id)
        .bind(&record.creator_id)
        .bind(&record.unique_email)
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.settings)?)
        .bind(record.trigger_count)
        .bind(record.last_triggered.map(|t| t.to_rfc3339()))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(&self, id: &str, status: TriggerStatus) -> Result<()> {
        sqlx::query("UPDATE email_triggers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump `trigger_count` and `last_triggered` after a successful enqueue
    pub async fn record_firing(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE email_triggers SET trigger_count = trigger_count + 1, last_triggered = ?, updated_at = ? WHERE id = ?",
        )
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_for_flow(&self, flow_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM email_triggers WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TriggerRecord> {
    let status: String = row.get("status");
    let settings: String = row.get("settings");
    let last_triggered: Option<String> = row.get("last_triggered");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(TriggerRecord {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        creator_id: row.get("creator_id"),
        unique_email: row.get("unique_email"),
        status: TriggerStatus::parse(&status)?,
        settings: serde_json::from_str(&settings)?,
        trigger_count: row.get("trigger_count"),
        last_triggered: last_triggered.as_deref().map(parse_time).transpose()?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

/// Outcome of one recipient of one inbound email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundStatus {
    Processed,
    Filtered,
    Failed,
    Testing,
}

impl InboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundStatus::Processed => "processed",
            InboundStatus::Filtered => "filtered",
            InboundStatus::Failed => "failed",
            InboundStatus::Testing => "testing",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "processed" => Ok(InboundStatus::Processed),
            "filtered" => Ok(InboundStatus::Filtered),
            "failed" => Ok(InboundStatus::Failed),
            "testing" => Ok(InboundStatus::Testing),
            other => Err(anyhow::anyhow!("Unknown inbound status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundLogEntry {
    pub id: String,
    pub trigger_id: String,
    pub flow_id: Option<String>,
    pub execution_id: Option<String>,
    pub message_id: Option<String>,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub status: InboundStatus,
    pub reason: Option<String>,
    /// Epoch milliseconds
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub struct InboundLogStorage {
    pool: SqlitePool,
}

impl InboundLogStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &InboundLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_trigger_logs
                (id, trigger_id, flow_id, execution_id, message_id, from_address, subject, status, reason, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.trigger_id)
        .bind(&entry.flow_id)
        .bind(&entry.execution_id)
        .bind(&entry.message_id)
        .bind(&entry.from_address)
        .bind(&entry.subject)
        .bind(entry.status.as_str())
        .bind(&entry.reason)
        .bind(entry.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append `entry` only while the trigger's processed firings since `hour_since_ms` and
    /// `day_since_ms` are below `max_per_hour` and `max_per_day`. Count and insert run as one
    /// statement, so concurrent deliveries cannot both take the last slot.
    pub async fn insert_within_caps(
        &self,
        entry: &InboundLogEntry,
        hour_since_ms: i64,
        max_per_hour: i64,
        day_since_ms: i64,
        max_per_day: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_trigger_logs
                (id, trigger_id, flow_id, execution_id, message_id, from_address, subject, status, reason, received_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM email_trigger_logs
                   WHERE trigger_id = ? AND status = 'processed' AND received_at >= ?) < ?
              AND (SELECT COUNT(*) FROM email_trigger_logs
                   WHERE trigger_id = ? AND status = 'processed' AND received_at >= ?) < ?
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.trigger_id)
        .bind(&entry.flow_id)
        .bind(&entry.execution_id)
        .bind(&entry.message_id)
        .bind(&entry.from_address)
        .bind(&entry.subject)
        .bind(entry.status.as_str())
        .bind(&entry.reason)
        .bind(entry.received_at)
        .bind(&entry.trigger_id)
        .bind(hour_since_ms)
        .bind(max_per_hour)
        .bind(&entry.trigger_id)
        .bind(day_since_ms)
        .bind(max_per_day)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrite the outcome of an existing entry, dropping its execution id
    pub async fn set_outcome(&self, id: &str, status: InboundStatus, reason: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE email_trigger_logs SET status = ?, reason = ?, execution_id = NULL WHERE id = ?")
            .bind(status.as_str())
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Processed firings of a trigger at or after `since_ms`
    pub async fn count_processed_since(&self, trigger_id: &str, since_ms: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM email_trigger_logs WHERE trigger_id = ? AND status = 'processed' AND received_at >= ?",
        )
        .bind(trigger_id)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Delete at most `limit` entries older than `cutoff_ms`, returning how many went
    pub async fn delete_older_than(&self, cutoff_ms: i64, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM email_trigger_logs WHERE id IN (
                SELECT id FROM email_trigger_logs WHERE received_at < ? ORDER BY received_at LIMIT ?
            )
            "#,
        )
        .bind(cutoff_ms)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Most recent entries for a trigger
    pub async fn list_for_trigger(&self, trigger_id: &str, limit: i64) -> Result<Vec<InboundLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trigger_id, flow_id, execution_id, message_id, from_address, subject, status, reason, received_at
            FROM email_trigger_logs WHERE trigger_id = ? ORDER BY received_at DESC LIMIT ?
            "#,
        )
        .bind(trigger_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(InboundLogEntry {
                    id: row.get("id"),
                    trigger_id: row.get("trigger_id"),
                    flow_id: row.get("flow_id"),
                    execution_id: row.get("execution_id"),
                    message_id: row.get("message_id"),
                    from_address: row.get("from_address"),
                    subject: row.get("subject"),
                    status: InboundStatus::parse(&status)?,
                    reason: row.get("reason"),
                    received_at: row.get("received_at"),
                })
            })
            .collect()
    }
}
