/// SQLite persistence layer for flow documents
///
/// Flows are stored as JSON for flexibility; `creator_id` and `status` are mirrored
/// into columns for owner listing. Every mutation is a read-modify-write of one
/// document, which is all the per-document consistency the engine relies on.

use crate::flow::types::{Flow, FlowStatus, ScheduleMeta};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};

#[derive(Debug, Clone)]
pub struct FlowStorage {
    pool: SqlitePool,
}

impl FlowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new flow or replace an existing one
    pub async fn save_flow(&self, flow: &Flow) -> Result<()> {
        let definition_json = serde_json::to_string(flow)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO flows (id, creator_id, status, definition, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                creator_id = excluded.creator_id,
                status = excluded.status,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&flow.id)
        .bind(&flow.creator_id)
        .bind(u8::from(flow.status) as i64)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a flow by ID. A stored document that no longer parses is an error.
    pub async fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                let flow: Flow = serde_json::from_str(&definition_json)
                    .map_err(|e| anyhow::anyhow!("Malformed flow document '{}': {}", id, e))?;
                Ok(Some(flow))
            }
            None => Ok(None),
        }
    }

    /// List a user's flows, most recently updated first
    pub async fn list_flows(&self, creator_id: &str) -> Result<Vec<FlowSummary>> {
        let rows = sqlx::query(
            "SELECT id, status, definition, updated_at FROM flows WHERE creator_id = ? ORDER BY updated_at DESC",
        )
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_json: String = row.get("definition");
            let definition: Value = serde_json::from_str(&definition_json).unwrap_or(Value::Null);
            let status: i64 = row.get("status");
            flows.push(FlowSummary {
                id: row.get("id"),
                name: definition
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                status,
                trigger: definition
                    .pointer("/trigger/node_id")
                    .and_then(|n| n.as_str())
                    .map(str::to_string),
                updated_at: row.get("updated_at"),
            });
        }

        Ok(flows)
    }

    /// Set status and schedule metadata in one write
    pub async fn set_activation(
        &self,
        id: &str,
        status: FlowStatus,
        schedule: Option<ScheduleMeta>,
    ) -> Result<()> {
        let mut flow = self
            .get_flow(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", id))?;
        flow.status = status;
        flow.schedule = schedule;
        self.save_flow(&flow).await
    }

    /// Set status only, keeping any schedule metadata
    pub async fn set_status(&self, id: &str, status: FlowStatus) -> Result<()> {
        let mut flow = self
            .get_flow(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", id))?;
        flow.status = status;
        self.save_flow(&flow).await
    }

    /// Write a single key into the trigger's `propsData`
    pub async fn set_trigger_prop(&self, id: &str, key: &str, value: Value) -> Result<()> {
        let mut flow = self
            .get_flow(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", id))?;
        let trigger = flow
            .trigger
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Flow '{}' has no trigger", id))?;
        trigger.props.insert(key.to_string(), value);
        self.save_flow(&flow).await
    }

    pub async fn delete_flow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Basic flow metadata for listing operations
#[derive(Debug, serde::Serialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub status: i64,
    pub trigger: Option<String>,
    pub updated_at: String,
}
