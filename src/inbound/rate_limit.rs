/// Per-trigger rate limiting over rolling windows
///
/// Counts processed firings in the trailing hour and day. A firing takes its slot by
/// inserting its processed log entry under the caps in one statement. Old log entries
/// are pruned in the background in bounded batches so the window queries stay cheap.

use crate::inbound::storage::{InboundLogEntry, InboundLogStorage, TriggerSettings};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

/// Upper bound of log entries removed per cleanup pass
pub const CLEANUP_BATCH: i64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { hourly: i64, daily: i64 },
    Denied { reason: &'static str },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

pub const HOURLY_RATE_LIMIT_EXCEEDED: &str = "HOURLY_RATE_LIMIT_EXCEEDED";
pub const DAILY_RATE_LIMIT_EXCEEDED: &str = "DAILY_RATE_LIMIT_EXCEEDED";

#[derive(Debug, Clone)]
pub struct RateLimiter {
    logs: InboundLogStorage,
}

impl RateLimiter {
    pub fn new(logs: InboundLogStorage) -> Self {
        Self { logs }
    }

    /// Decide whether one more firing fits within the trigger's caps
    pub async fn check(&self, trigger_id: &str, settings: &TriggerSettings, now: DateTime<Utc>) -> Result<RateDecision> {
        let hour_ago = (now - Duration::hours(1)).timestamp_millis();
        let day_ago = (now - Duration::hours(24)).timestamp_millis();

        let hourly = self.logs.count_processed_since(trigger_id, hour_ago).await?;
        if hourly >= settings.max_per_hour as i64 {
            tracing::warn!("🚦 Trigger {} hit hourly cap ({}/{})", trigger_id, hourly, settings.max_per_hour);
            return Ok(RateDecision::Denied { reason: HOURLY_RATE_LIMIT_EXCEEDED });
        }

        let daily = self.logs.count_processed_since(trigger_id, day_ago).await?;
        if daily >= settings.max_per_day as i64 {
            tracing::warn!("🚦 Trigger {} hit daily cap ({}/{})", trigger_id, daily, settings.max_per_day);
            return Ok(RateDecision::Denied { reason: DAILY_RATE_LIMIT_EXCEEDED });
        }

        Ok(RateDecision::Allowed { hourly, daily })
    }

    /// Claim a slot for `entry` (a processed firing) or report which cap is full.
    ///
    /// On `Allowed` the entry is already in the log; a firing that later fails must
    /// rewrite it with [`InboundLogStorage::set_outcome`].
    pub async fn reserve(&self, entry: &InboundLogEntry, settings: &TriggerSettings, now: DateTime<Utc>) -> Result<RateDecision> {
        let decision = self.check(&entry.trigger_id, settings, now).await?;
        let RateDecision::Allowed { hourly, daily } = decision else {
            return Ok(decision);
        };

        let hour_ago = (now - Duration::hours(1)).timestamp_millis();
        let day_ago = (now - Duration::hours(24)).timestamp_millis();
        let reserved = self
            .logs
            .insert_within_caps(
                entry,
                hour_ago,
                settings.max_per_hour as i64,
                day_ago,
                settings.max_per_day as i64,
            )
            .await?;
        if reserved {
            return Ok(RateDecision::Allowed { hourly: hourly + 1, daily: daily + 1 });
        }

        // Another delivery took the last slot between the count and the insert
        let hourly = self.logs.count_processed_since(&entry.trigger_id, hour_ago).await?;
        let reason = if hourly >= settings.max_per_hour as i64 {
            HOURLY_RATE_LIMIT_EXCEEDED
        } else {
            DAILY_RATE_LIMIT_EXCEEDED
        };
        tracing::warn!("🚦 Trigger {} lost the last slot: {}", entry.trigger_id, reason);
        Ok(RateDecision::Denied { reason })
    }

    /// One bounded pass removing entries older than 24 hours
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = (now - Duration::hours(24)).timestamp_millis();
        let removed = self.logs.delete_older_than(cutoff, CLEANUP_BATCH).await?;
        if removed > 0 {
            tracing::debug!("🧹 Pruned {} inbound log entries", removed);
        }
        Ok(removed)
    }

    /// Fire-and-forget cleanup; failures are logged and retried on the next cycle
    pub fn spawn_cleanup(&self) {
        let limiter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = limiter.cleanup(Utc::now()).await {
                tracing::warn!("⚠️ Inbound log cleanup failed (will retry next cycle): {:#}", e);
            }
        });
    }
}
