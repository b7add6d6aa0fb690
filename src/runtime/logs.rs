/// Execution and step logs
///
/// One run document per execution id, plus one step document per executed node keyed
/// `trigger-{node_id}` (index -1) or `step-{index}-{node_id}`. Results are stored as a
/// size-capped summary, never verbatim.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::{sqlite::SqlitePool, Row};

/// Strings longer than this are cut in step summaries
pub const MAX_SUMMARY_STRING: usize = 500;
/// Arrays longer than this are replaced by a preview
pub const MAX_SUMMARY_ARRAY: usize = 10;
const SUMMARY_PREVIEW_ITEMS: usize = 3;
const MAX_SUMMARY_DEPTH: usize = 5;

/// Index recorded for the trigger node
pub const TRIGGER_INDEX: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown run status: {}", other)),
        }
    }
}

/// Failure attached to a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLog {
    pub id: String,
    pub flow_id: String,
    pub user_id: Option<String>,
    pub status: RunStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration: Option<i64>,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub error: Option<RunError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepLog {
    pub key: String,
    pub index: i64,
    pub node_id: String,
    pub name: String,
    pub status: RunStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration: Option<i64>,
    pub result_summary: Option<Value>,
    pub error: Option<String>,
}

/// Document key of a step log, also used as the node's label in the result accumulator
pub fn step_key(index: i64, node_id: &str) -> String {
    if index < 0 {
        format!("trigger-{}", node_id)
    } else {
        format!("step-{}-{}", index, node_id)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLogStorage {
    pool: SqlitePool,
}

impl ExecutionLogStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run_exists(&self, execution_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM flow_executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Create the run document in `running` state
    pub async fn create_run(
        &self,
        execution_id: &str,
        flow_id: &str,
        user_id: &str,
        steps_total: usize,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_executions (id, flow_id, user_id, status, start_time, steps_total, steps_completed)
            VALUES (?, ?, ?, 'running', ?, ?, 0)
            "#,
        )
        .bind(execution_id)
        .bind(flow_id)
        .bind(user_id)
        .bind(start_time.to_rfc3339())
        .bind(steps_total as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record progress; clamped so it never exceeds `steps_total`
    pub async fn set_steps_completed(&self, execution_id: &str, completed: usize) -> Result<()> {
        sqlx::query("UPDATE flow_executions SET steps_completed = MIN(?, steps_total) WHERE id = ?")
            .bind(completed as i64)
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a running run to its terminal state. Returns false if it was already final.
    pub async fn finalize_run(
        &self,
        execution_id: &str,
        status: RunStatus,
        end_time: DateTime<Utc>,
        duration_ms: i64,
        error: Option<&RunError>,
    ) -> Result<bool> {
        let error_json = error.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE flow_executions
            SET status = ?, end_time = ?, duration_ms = ?, error = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(end_time.to_rfc3339())
        .bind(duration_ms)
        .bind(error_json)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn start_step(
        &self,
        execution_id: &str,
        index: i64,
        node_id: &str,
        name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<String> {
        let key = step_key(index, node_id);
        sqlx::query(
            r#"
            INSERT INTO flow_execution_steps (execution_id, step_key, step_index, node_id, name, status, started_at)
            VALUES (?, ?, ?, ?, ?, 'running', ?)
            "#,
        )
        .bind(execution_id)
        .bind(&key)
        .bind(index)
        .bind(node_id)
        .bind(name)
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(key)
    }

    pub async fn finish_step(
        &self,
        execution_id: &str,
        key: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        duration_ms: i64,
        result_summary: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let summary_json = result_summary.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            UPDATE flow_execution_steps
            SET status = ?, ended_at = ?, duration_ms = ?, result_summary = ?, error = ?
            WHERE execution_id = ? AND step_key = ?
            "#,
        )
        .bind(status.as_str())
        .bind(ended_at.to_rfc3339())
        .bind(duration_ms)
        .bind(summary_json)
        .bind(error)
        .bind(execution_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip a step to `failed`, keeping its timing and result summary
    pub async fn fail_step(&self, execution_id: &str, key: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flow_execution_steps
            SET status = 'failed', error = ?, ended_at = COALESCE(ended_at, ?)
            WHERE execution_id = ? AND step_key = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(execution_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, execution_id: &str) -> Result<Option<ExecutionLog>> {
        let row = sqlx::query(
            r#"
            SELECT id, flow_id, user_id, status, start_time, end_time, duration_ms,
                   steps_total, steps_completed, error
            FROM flow_executions WHERE id = ?
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let error: Option<String> = row.get("error");
        Ok(Some(ExecutionLog {
            id: row.get("id"),
            flow_id: row.get("flow_id"),
            user_id: row.get("user_id"),
            status: RunStatus::parse(&status)?,
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            duration: row.get("duration_ms"),
            steps_total: row.get("steps_total"),
            steps_completed: row.get("steps_completed"),
            error: error.map(|e| serde_json::from_str(&e)).transpose()?,
        }))
    }

    /// Step logs of a run, trigger first then in step order
    pub async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepLog>> {
        let rows = sqlx::query(
            r#"
            SELECT step_key, step_index, node_id, name, status, started_at, ended_at,
                   duration_ms, result_summary, error
            FROM flow_execution_steps WHERE execution_id = ? ORDER BY step_index ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let summary: Option<String> = row.get("result_summary");
            steps.push(StepLog {
                key: row.get("step_key"),
                index: row.get("step_index"),
                node_id: row.get("node_id"),
                name: row.get("name"),
                status: RunStatus::parse(&status)?,
                started_at: row.get("started_at"),
                ended_at: row.get("ended_at"),
                duration: row.get("duration_ms"),
                result_summary: summary.map(|s| serde_json::from_str(&s)).transpose()?,
                error: row.get("error"),
            });
        }
        Ok(steps)
    }
}

/// Size-capped copy of a node result for step logs
pub fn summarize_result(value: &Value) -> Value {
    summarize_at(value, 0)
}

fn summarize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_SUMMARY_DEPTH {
        return match value {
            Value::Object(_) | Value::Array(_) => json!("[nested data omitted]"),
            other => summarize_scalar(other),
        };
    }

    match value {
        Value::Array(items) if items.len() > MAX_SUMMARY_ARRAY => json!({
            "_type": "array",
            "length": items.len(),
            "preview": items
                .iter()
                .take(SUMMARY_PREVIEW_ITEMS)
                .map(|item| summarize_at(item, depth + 1))
                .collect::<Vec<_>>(),
        }),
        Value::Array(items) => Value::Array(items.iter().map(|item| summarize_at(item, depth + 1)).collect()),
        Value::Object(map) => {
            let summarized: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), summarize_at(v, depth + 1)))
                .collect();
            Value::Object(summarized)
        }
        other => summarize_scalar(other),
    }
}

fn summarize_scalar(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_SUMMARY_STRING => {
            let cut: String = s.chars().take(MAX_SUMMARY_STRING).collect();
            Value::String(format!("{}...[truncated]", cut))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_keys_distinguish_trigger_and_steps() {
        assert_eq!(step_key(TRIGGER_INDEX, "email-trigger"), "trigger-email-trigger");
        assert_eq!(step_key(2, "http-request"), "step-2-http-request");
    }

    #[test]
    fn long_strings_are_truncated() {
        let long = "a".repeat(900);
        let summary = summarize_result(&json!({ "body": long }));
        let body = summary["body"].as_str().unwrap();
        assert!(body.starts_with(&"a".repeat(MAX_SUMMARY_STRING)));
        assert!(body.ends_with("...[truncated]"));
        assert_eq!(body.len(), MAX_SUMMARY_STRING + "...[truncated]".len());
    }

    #[test]
    fn large_arrays_become_previews() {
        let rows: Vec<Value> = (0..25).map(|i| json!({ "row": i })).collect();
        let summary = summarize_result(&json!({ "rows": rows, "small": [1, 2] }));
        assert_eq!(summary["rows"]["_type"], json!("array"));
        assert_eq!(summary["rows"]["length"], json!(25));
        assert_eq!(summary["rows"]["preview"].as_array().unwrap().len(), 3);
        assert_eq!(summary["small"], json!([1, 2]));
    }

    #[test]
    fn deep_nesting_is_cut_off() {
        let deep = json!({ "a": { "b": { "c": { "d": { "e": { "f": 1 } } } } } });
        let summary = summarize_result(&deep);
        assert_eq!(summary["a"]["b"]["c"]["d"]["e"], json!("[nested data omitted]"));
    }
}
