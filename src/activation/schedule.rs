/// Schedule Activators
///
/// Absolute-time triggers become one-shot dispatches at a UTC instant; recurring
/// triggers become cron registrations whose hour/minute fields are shifted to UTC.
/// Nothing is persisted on the flow until the Job Scheduler has accepted the job.

use crate::activation::ActivationOutcome;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::flow::{Flow, FlowStatus, FlowStorage, ScheduleMeta, INTERVAL_TRIGGER, SCHEDULE_TRIGGER};
use crate::runtime::orchestrator::ExecutionRequest;
use crate::scheduler::{CronRequest, DispatchRequest, JobScheduler};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// How far in the past an absolute instant may be and still be accepted
pub const PAST_TOLERANCE_SECS: i64 = 15;

pub fn parse_timezone(name: &str) -> EngineResult<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidArgument(format!("Unknown timezone: {}", name)))
}

/// Interpret a local wall-clock `date` + `time` in `timezone` as a UTC instant.
///
/// Ambiguous times (clocks going back) resolve to the earlier instant. Times inside a
/// DST gap use the offset in force before the transition.
pub fn local_to_utc(date: &str, time: &str, timezone: &str) -> EngineResult<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidArgument(format!("Invalid date '{}', expected YYYY-MM-DD", date)))?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M:%S"))
        .map_err(|_| EngineError::InvalidArgument(format!("Invalid time '{}', expected HH:MM", time)))?;
    let naive = date.and_time(time);

    let utc = match tz.from_local_datetime(&naive) {
        LocalResult::Single(local) => local.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let offset = tz.offset_from_utc_datetime(&naive).fix().local_minus_utc();
            Utc.from_utc_datetime(&(naive - Duration::seconds(offset as i64)))
        }
    };
    Ok(utc)
}

/// UTC offset of `tz` at `at`, in minutes east of UTC
pub fn offset_minutes_at(tz: &Tz, at: DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&at.naive_utc()).fix().local_minus_utc() / 60
}

/// A plain numeric cron field, range-checked against `0..=max`
fn numeric_field(field: &str, name: &str, max: i32) -> EngineResult<Option<i32>> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    match field.parse::<i32>() {
        Ok(value) if value <= max => Ok(Some(value)),
        _ => Err(EngineError::InvalidArgument(format!(
            "Cron {} '{}' is out of range 0-{}",
            name, field, max
        ))),
    }
}

/// Shift a local five-field cron to UTC for a zone `offset_minutes` east of UTC.
///
/// Only plain numeric minute/hour fields move; wildcards, ranges, lists and steps are
/// kept as written, and day fields never roll over midnight.
pub fn convert_cron_to_utc(cron: &str, offset_minutes: i32) -> EngineResult<String> {
    let mut fields: Vec<String> = cron.split_whitespace().map(str::to_string).collect();
    if fields.len() != 5 {
        return Err(EngineError::InvalidArgument(format!(
            "Cron expression must have 5 fields, got {}: '{}'",
            fields.len(),
            cron
        )));
    }

    let minute = numeric_field(&fields[0], "minute", 59)?;
    let hour = numeric_field(&fields[1], "hour", 23)?;
    match (minute, hour) {
        (Some(minute), Some(hour)) => {
            let total = (hour * 60 + minute - offset_minutes).rem_euclid(24 * 60);
            fields[0] = (total % 60).to_string();
            fields[1] = (total / 60).to_string();
        }
        (None, Some(hour)) => {
            fields[1] = (hour - offset_minutes / 60).rem_euclid(24).to_string();
        }
        (Some(minute), None) => {
            fields[0] = (minute - offset_minutes % 60).rem_euclid(60).to_string();
        }
        (None, None) => {}
    }

    Ok(fields.join(" "))
}

fn scheduling_error(e: anyhow::Error) -> EngineError {
    EngineError::Internal(format!("Failed to register schedule: {:#}", e))
}

pub struct ScheduleActivator {
    flows: FlowStorage,
    scheduler: Arc<dyn JobScheduler>,
    config: Arc<Config>,
}

impl ScheduleActivator {
    pub fn new(flows: FlowStorage, scheduler: Arc<dyn JobScheduler>, config: Arc<Config>) -> Self {
        Self { flows, scheduler, config }
    }

    pub async fn activate_absolute(&self, flow: &Flow) -> EngineResult<ActivationOutcome> {
        self.activate_absolute_at(flow, Utc::now()).await
    }

    /// Arm a one-shot trigger relative to `now`
    pub async fn activate_absolute_at(&self, flow: &Flow, now: DateTime<Utc>) -> EngineResult<ActivationOutcome> {
        let trigger = trigger_of(flow)?;
        let date = trigger
            .prop_str("date")
            .ok_or_else(|| EngineError::InvalidArgument("Schedule trigger requires a date".to_string()))?;
        let time = trigger
            .prop_str("time")
            .ok_or_else(|| EngineError::InvalidArgument("Schedule trigger requires a time".to_string()))?;
        let timezone = trigger.prop_str("timezone").unwrap_or("UTC");

        let scheduled_for = local_to_utc(date, time, timezone)?;
        if scheduled_for < now - Duration::seconds(PAST_TOLERANCE_SECS) {
            return Err(EngineError::InvalidArgument(format!(
                "Scheduled time {} {} ({}) is in the past",
                date, time, timezone
            )));
        }

        let body = self.execution_body(
            flow,
            Some(Uuid::new_v4().to_string()),
            json!({ "triggerType": SCHEDULE_TRIGGER, "scheduledFor": scheduled_for.to_rfc3339() }),
        )?;
        let message_id = self
            .scheduler
            .publish(DispatchRequest {
                destination: self.config.execution_url(),
                body,
                not_before: Some(scheduled_for.timestamp()),
                retries: self.config.scheduler.retries,
                failure_callback: Some(self.config.failure_callback_url()),
            })
            .await
            .map_err(scheduling_error)?;

        let schedule = ScheduleMeta {
            message_id: Some(message_id.clone()),
            timezone: Some(timezone.to_string()),
            scheduled_for: Some(scheduled_for),
            created_at: now,
            ..Default::default()
        };
        self.commit(flow, &message_id, schedule).await?;

        tracing::info!("⏰ Flow {} armed for {} (message {})", flow.id, scheduled_for, message_id);
        Ok(ActivationOutcome {
            message_id: Some(message_id),
            scheduled_for: Some(scheduled_for),
            ..ActivationOutcome::new(SCHEDULE_TRIGGER)
        })
    }

    pub async fn activate_recurring(&self, flow: &Flow) -> EngineResult<ActivationOutcome> {
        self.activate_recurring_at(flow, Utc::now()).await
    }

    /// Register a recurring trigger using the zone offset in force at `now`
    pub async fn activate_recurring_at(&self, flow: &Flow, now: DateTime<Utc>) -> EngineResult<ActivationOutcome> {
        let trigger = trigger_of(flow)?;
        let cron = trigger
            .prop_str("cron")
            .ok_or_else(|| EngineError::InvalidArgument("Interval trigger requires a cron expression".to_string()))?;
        let timezone = trigger.prop_str("timezone");

        let cron_used = match timezone {
            Some(name) => {
                let tz = parse_timezone(name)?;
                convert_cron_to_utc(cron, offset_minutes_at(&tz, now))?
            }
            None => convert_cron_to_utc(cron, 0)?,
        };
        tracing::debug!("🕐 Cron '{}' ({}) registers as '{}' UTC", cron, timezone.unwrap_or("UTC"), cron_used);

        let body = self.execution_body(flow, None, json!({ "triggerType": INTERVAL_TRIGGER, "cron": cron_used }))?;
        let schedule_id = self
            .scheduler
            .schedule(CronRequest {
                destination: self.config.execution_url(),
                cron: cron_used.clone(),
                body,
                retries: self.config.scheduler.retries,
                failure_callback: Some(self.config.failure_callback_url()),
            })
            .await
            .map_err(scheduling_error)?;

        let schedule = ScheduleMeta {
            schedule_id: Some(schedule_id.clone()),
            cron: Some(cron.to_string()),
            cron_used: Some(cron_used.clone()),
            timezone: timezone.map(str::to_string),
            created_at: now,
            ..Default::default()
        };
        self.commit(flow, &schedule_id, schedule).await?;

        tracing::info!("🔁 Flow {} scheduled on '{}' (schedule {})", flow.id, cron_used, schedule_id);
        Ok(ActivationOutcome {
            schedule_id: Some(schedule_id),
            cron_used: Some(cron_used),
            ..ActivationOutcome::new(INTERVAL_TRIGGER)
        })
    }

    /// Cancel whatever registration the flow currently holds
    pub async fn deactivate(&self, flow: &Flow) -> EngineResult<()> {
        let Some(schedule) = &flow.schedule else {
            return Ok(());
        };
        for id in schedule.schedule_id.iter().chain(schedule.message_id.iter()) {
            self.scheduler
                .cancel(id)
                .await
                .map_err(|e| EngineError::Internal(format!("Failed to cancel schedule {}: {:#}", id, e)))?;
            tracing::info!("🛑 Cancelled {} for flow {}", id, flow.id);
        }
        Ok(())
    }

    /// Point the flow at the registration `new_id`, then release the one it replaces.
    /// If the flow cannot be updated, `new_id` is cancelled and the old registration stays.
    async fn commit(&self, flow: &Flow, new_id: &str, schedule: ScheduleMeta) -> EngineResult<()> {
        if let Err(e) = self
            .flows
            .set_activation(&flow.id, FlowStatus::Active, Some(schedule))
            .await
        {
            if let Err(cancel) = self.scheduler.cancel(new_id).await {
                tracing::warn!("⚠️ Registration {} for flow {} left orphaned: {:#}", new_id, flow.id, cancel);
            }
            return Err(e.into());
        }
        self.release_previous(flow).await;
        Ok(())
    }

    /// Re-activation replaces the prior registration; a failed cancel only leaves a stale job
    async fn release_previous(&self, flow: &Flow) {
        if let Err(e) = self.deactivate(flow).await {
            tracing::warn!("⚠️ Previous schedule for flow {} not cancelled: {}", flow.id, e);
        }
    }

    fn execution_body(&self, flow: &Flow, execution_id: Option<String>, trigger_input: Value) -> EngineResult<Value> {
        let request = ExecutionRequest {
            flow_id: flow.id.clone(),
            user_id: flow.creator_id.clone(),
            execution_id,
            trigger_input,
        };
        serde_json::to_value(request).map_err(|e| EngineError::Internal(e.to_string()))
    }
}

fn trigger_of(flow: &Flow) -> EngineResult<&crate::flow::TriggerSpec> {
    flow.trigger
        .as_ref()
        .ok_or_else(|| EngineError::FailedPrecondition(format!("Flow {} has no trigger", flow.id)))
}
