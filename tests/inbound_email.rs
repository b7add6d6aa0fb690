//! Integration tests for inbound email processing and rate limiting.

mod common;

use chrono::{Duration, Utc};
use common::{flow, node, store, RecordingScheduler, DOMAIN, OWNER};
use flowkeeper::{
    flow::{FlowStatus, FlowStorage},
    inbound::{
        normalize::normalize, rate_limit::CLEANUP_BATCH, InboundEmailProcessor, InboundLogEntry,
        InboundLogStorage, InboundStatus, RateDecision, RateLimiter, TriggerRecord, TriggerSettings,
        TriggerStatus, TriggerStorage,
    },
    scheduler::JobScheduler,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const TRIGGER: &str = "usrflw7k";

struct Fixture {
    flows: FlowStorage,
    triggers: TriggerStorage,
    logs: InboundLogStorage,
    scheduler: Arc<RecordingScheduler>,
    processor: InboundEmailProcessor,
}

async fn fixture_with(scheduler: Arc<RecordingScheduler>) -> Fixture {
    let pool = common::pool().await;
    let flows = FlowStorage::new(pool.clone());
    let triggers = TriggerStorage::new(pool.clone());
    let logs = InboundLogStorage::new(pool);
    let dyn_scheduler: Arc<dyn JobScheduler> = scheduler.clone();
    let processor = InboundEmailProcessor::new(
        triggers.clone(),
        logs.clone(),
        flows.clone(),
        dyn_scheduler,
        Arc::new(common::test_config()),
    );
    Fixture { flows, triggers, logs, scheduler, processor }
}

async fn fixture() -> Fixture {
    fixture_with(RecordingScheduler::new()).await
}

/// Active flow `f-inbox` with an active trigger `TRIGGER`
async fn arm(fx: &Fixture, settings: TriggerSettings) {
    let mut f = flow("f-inbox", node("email-trigger", json!({})), vec![node("http-request", json!({}))]);
    f.status = FlowStatus::Active;
    store(&fx.flows, &f).await;

    let now = Utc::now();
    let inserted = fx
        .triggers
        .insert_if_absent(&TriggerRecord {
            id: TRIGGER.to_string(),
            flow_id: "f-inbox".to_string(),
            creator_id: OWNER.to_string(),
            unique_email: format!("{}@{}", TRIGGER, DOMAIN),
            status: TriggerStatus::Active,
            settings,
            trigger_count: 0,
            last_triggered: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    assert!(inserted);
}

fn email_to(recipients: &[&str], subject: &str) -> Value {
    json!({
        "event": "email_received",
        "data": {
            "message_id": "m-1",
            "subject": subject,
            "from": { "address": "Alice@Corp.com" },
            "to": recipients,
            "date": "2024-05-01T10:00:00Z",
            "text": "hello"
        }
    })
}

fn trigger_address() -> String {
    format!("{}@{}", TRIGGER, DOMAIN)
}

#[tokio::test]
async fn matching_recipient_enqueues_an_execution() {
    let fx = fixture().await;
    arm(&fx, TriggerSettings::default()).await;

    let address = trigger_address();
    let response = fx
        .processor
        .process(&email_to(&["someone@else.com", address.to_uppercase().as_str()], "Invoice"))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.processed_triggers, 1);
    assert_eq!(response.results.len(), 1);
    let result = &response.results[0];
    assert_eq!(result.trigger_id, TRIGGER);
    assert_eq!(result.status, InboundStatus::Processed);
    assert_eq!(result.flow_id.as_deref(), Some("f-inbox"));
    let execution_id = result.execution_id.clone().unwrap();

    let published = fx.scheduler.published();
    assert_eq!(published.len(), 1);
    let body = &published[0].body;
    assert_eq!(published[0].destination, "http://engine.test/api/executions");
    assert_eq!(published[0].retries, 1);
    assert_eq!(body["flowId"], json!("f-inbox"));
    assert_eq!(body["userId"], json!(OWNER));
    assert_eq!(body["executionId"], json!(execution_id));
    assert_eq!(body["triggerInput"]["triggerId"], json!(TRIGGER));
    assert_eq!(body["triggerInput"]["email"]["subject"], json!("Invoice"));
    assert_eq!(body["triggerInput"]["email"]["fromAddress"], json!("alice@corp.com"));

    let record = fx.triggers.get(TRIGGER).await.unwrap().unwrap();
    assert_eq!(record.trigger_count, 1);
    assert!(record.last_triggered.is_some());

    let logs = fx.logs.list_for_trigger(TRIGGER, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, InboundStatus::Processed);
    assert_eq!(logs[0].execution_id.as_deref(), Some(execution_id.as_str()));
    assert_eq!(logs[0].message_id.as_deref(), Some("m-1"));
}

#[tokio::test]
async fn hourly_cap_filters_the_next_email() {
    let fx = fixture().await;
    arm(&fx, TriggerSettings { max_per_hour: 2, ..Default::default() }).await;

    let address = trigger_address();
    let mut statuses = Vec::new();
    for i in 0..3 {
        let response = fx
            .processor
            .process(&email_to(&[address.as_str()], &format!("Order {}", i)))
            .await
            .unwrap();
        statuses.push((response.results[0].status, response.results[0].reason.clone()));
    }

    assert_eq!(statuses[0].0, InboundStatus::Processed);
    assert_eq!(statuses[1].0, InboundStatus::Processed);
    assert_eq!(statuses[2], (InboundStatus::Filtered, Some("HOURLY_RATE_LIMIT_EXCEEDED".to_string())));
    assert_eq!(fx.scheduler.published().len(), 2);
    assert_eq!(fx.triggers.get(TRIGGER).await.unwrap().unwrap().trigger_count, 2);
}

#[tokio::test]
async fn unknown_trigger_does_not_block_other_recipients() {
    let fx = fixture().await;
    arm(&fx, TriggerSettings::default()).await;

    let unknown = format!("zzzz9999@{}", DOMAIN);
    let response = fx
        .processor
        .process(&email_to(&[unknown.as_str(), trigger_address().as_str()], "Hello"))
        .await
        .unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].trigger_id, "zzzz9999");
    assert_eq!(response.results[0].status, InboundStatus::Failed);
    assert_eq!(response.results[0].reason.as_deref(), Some("TRIGGER_NOT_FOUND"));
    assert_eq!(response.results[1].status, InboundStatus::Processed);
    assert_eq!(response.processed_triggers, 1);

    let missing_logs = fx.logs.list_for_trigger("zzzz9999", 10).await.unwrap();
    assert_eq!(missing_logs.len(), 1);
    assert_eq!(missing_logs[0].status, InboundStatus::Failed);
}

#[tokio::test]
async fn inactive_trigger_or_flow_is_filtered() {
    let fx = fixture().await;
    arm(&fx, TriggerSettings::default()).await;
    let address = trigger_address();

    fx.flows.set_status("f-inbox", FlowStatus::Draft).await.unwrap();
    let response = fx.processor.process(&email_to(&[address.as_str()], "Hi")).await.unwrap();
    assert_eq!(response.results[0].status, InboundStatus::Filtered);
    assert_eq!(response.results[0].reason.as_deref(), Some("FLOW_INACTIVE"));

    fx.triggers.set_status(TRIGGER, TriggerStatus::Inactive).await.unwrap();
    let response = fx.processor.process(&email_to(&[address.as_str()], "Hi")).await.unwrap();
    assert_eq!(response.results[0].status, InboundStatus::Filtered);
    assert_eq!(response.results[0].reason.as_deref(), Some("TRIGGER_INACTIVE"));

    assert!(fx.scheduler.published().is_empty());
    let logs = fx.logs.list_for_trigger(TRIGGER, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == InboundStatus::Filtered));
}

#[tokio::test]
async fn test_emails_are_logged_but_not_executed() {
    let fx = fixture().await;
    arm(&fx, TriggerSettings::default()).await;

    let response = fx
        .processor
        .process(&email_to(&[trigger_address().as_str()], "[TEST] is this on?"))
        .await
        .unwrap();

    assert_eq!(response.results[0].status, InboundStatus::Testing);
    assert_eq!(response.processed_triggers, 0);
    assert!(fx.scheduler.published().is_empty());
    assert_eq!(fx.triggers.get(TRIGGER).await.unwrap().unwrap().trigger_count, 0);
    assert_eq!(fx.logs.list_for_trigger(TRIGGER, 10).await.unwrap()[0].status, InboundStatus::Testing);
}

#[tokio::test]
async fn sender_and_attachment_filters_apply() {
    let fx = fixture().await;
    arm(
        &fx,
        TriggerSettings {
            allowed_senders: vec!["@vendor.com".to_string()],
            max_attachment_size_mb: 1,
            ..Default::default()
        },
    )
    .await;
    let address = trigger_address();

    let response = fx.processor.process(&email_to(&[address.as_str()], "Hi")).await.unwrap();
    assert_eq!(response.results[0].reason.as_deref(), Some("SENDER_NOT_ALLOWED"));

    let heavy = json!({
        "fromAddress": "billing@vendor.com",
        "toAddress": [address],
        "subject": "Scan",
        "attachments": [{ "filename": "scan.pdf", "size": 3 * 1024 * 1024 }]
    });
    let response = fx.processor.process(&heavy).await.unwrap();
    assert_eq!(response.results[0].status, InboundStatus::Filtered);
    assert_eq!(response.results[0].reason.as_deref(), Some("ATTACHMENT_TOO_LARGE"));

    let light = json!({
        "fromAddress": "billing@vendor.com",
        "toAddress": [address],
        "subject": "Receipt",
        "attachments": [{ "filename": "r.pdf", "size": 1024 }]
    });
    let response = fx.processor.process(&light).await.unwrap();
    assert_eq!(response.results[0].status, InboundStatus::Processed);
}

#[tokio::test]
async fn attachment_types_outside_the_allow_list_are_filtered() {
    let fx = fixture().await;
    arm(
        &fx,
        TriggerSettings {
            allowed_attachment_types: vec!["pdf".to_string(), "csv".to_string()],
            ..Default::default()
        },
    )
    .await;
    let address = trigger_address();

    let mixed = json!({
        "fromAddress": "billing@vendor.com",
        "toAddress": [address],
        "subject": "Bundle",
        "attachments": [
            { "filename": "r.pdf", "size": 1024 },
            { "filename": "run.exe", "contentType": "application/octet-stream", "size": 1024 }
        ]
    });
    let response = fx.processor.process(&mixed).await.unwrap();
    assert_eq!(response.results[0].status, InboundStatus::Filtered);
    assert_eq!(response.results[0].reason.as_deref(), Some("ATTACHMENT_TYPE_NOT_ALLOWED"));
    assert!(fx.scheduler.published().is_empty());

    let by_mime = json!({
        "fromAddress": "billing@vendor.com",
        "toAddress": [address],
        "subject": "Export",
        "attachments": [{ "filename": "export", "contentType": "text/csv", "size": 1024 }]
    });
    let response = fx.processor.process(&by_mime).await.unwrap();
    assert_eq!(response.results[0].status, InboundStatus::Processed);
}

#[tokio::test]
async fn enqueue_failures_are_reported_per_recipient() {
    let fx = fixture_with(RecordingScheduler::failing()).await;
    arm(&fx, TriggerSettings { max_per_hour: 1, ..Default::default() }).await;

    // A failed enqueue gives its slot back, so the second delivery is not rate limited
    for _ in 0..2 {
        let response = fx.processor.process(&email_to(&[trigger_address().as_str()], "Hi")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.results[0].status, InboundStatus::Failed);
        assert_eq!(response.results[0].reason.as_deref(), Some("ENQUEUE_FAILED"));
        assert!(response.results[0].execution_id.is_none());
    }
    assert_eq!(fx.triggers.get(TRIGGER).await.unwrap().unwrap().trigger_count, 0);

    let logs = fx.logs.list_for_trigger(TRIGGER, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == InboundStatus::Failed && l.execution_id.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_share_the_hourly_cap() {
    let fx = fixture().await;
    arm(&fx, TriggerSettings { max_per_hour: 1, ..Default::default() }).await;
    let processor = Arc::new(fx.processor);
    let address = trigger_address();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let processor = processor.clone();
            let payload = email_to(&[address.as_str()], &format!("Rush {}", i));
            tokio::spawn(async move { processor.process(&payload).await.unwrap() })
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        statuses.push((response.results[0].status, response.results[0].reason.clone()));
    }

    let processed = statuses.iter().filter(|(s, _)| *s == InboundStatus::Processed).count();
    assert_eq!(processed, 1);
    assert!(statuses
        .iter()
        .filter(|(s, _)| *s != InboundStatus::Processed)
        .all(|(s, r)| *s == InboundStatus::Filtered && r.as_deref() == Some("HOURLY_RATE_LIMIT_EXCEEDED")));
    assert_eq!(fx.scheduler.published().len(), 1);

    let logs = fx.logs.list_for_trigger(TRIGGER, 10).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.status == InboundStatus::Processed).count(), 1);
}

#[tokio::test]
async fn unrecognized_payloads_are_errors() {
    let fx = fixture().await;
    assert!(fx.processor.process(&json!({ "hello": "world" })).await.is_err());
    assert!(normalize(&json!({ "event": "email_received" })).is_err());
}

fn log_entry(status: InboundStatus, received_at: i64) -> InboundLogEntry {
    InboundLogEntry {
        id: Uuid::new_v4().to_string(),
        trigger_id: TRIGGER.to_string(),
        flow_id: Some("f-inbox".to_string()),
        execution_id: None,
        message_id: None,
        from_address: None,
        subject: None,
        status,
        reason: None,
        received_at,
    }
}

#[tokio::test]
async fn rate_limiter_counts_processed_firings_in_rolling_windows() {
    let pool = common::pool().await;
    let logs = InboundLogStorage::new(pool);
    let limiter = RateLimiter::new(logs.clone());
    let now = Utc::now();

    for minutes in [5, 90, 600] {
        logs.append(&log_entry(InboundStatus::Processed, (now - Duration::minutes(minutes)).timestamp_millis()))
            .await
            .unwrap();
    }
    logs.append(&log_entry(InboundStatus::Filtered, now.timestamp_millis())).await.unwrap();
    logs.append(&log_entry(InboundStatus::Processed, (now - Duration::hours(30)).timestamp_millis()))
        .await
        .unwrap();

    let roomy = TriggerSettings::default();
    assert_eq!(limiter.check(TRIGGER, &roomy, now).await.unwrap(), RateDecision::Allowed { hourly: 1, daily: 3 });

    let hourly = TriggerSettings { max_per_hour: 1, ..Default::default() };
    assert_eq!(
        limiter.check(TRIGGER, &hourly, now).await.unwrap(),
        RateDecision::Denied { reason: "HOURLY_RATE_LIMIT_EXCEEDED" }
    );

    let daily = TriggerSettings { max_per_day: 3, ..Default::default() };
    assert!(!limiter.check(TRIGGER, &daily, now).await.unwrap().is_allowed());

    assert_eq!(limiter.cleanup(now).await.unwrap(), 1);
    assert_eq!(limiter.cleanup(now).await.unwrap(), 0);
    assert_eq!(logs.list_for_trigger(TRIGGER, 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn cleanup_is_bounded_per_pass() {
    let pool = common::pool().await;
    let logs = InboundLogStorage::new(pool);
    let limiter = RateLimiter::new(logs.clone());
    let now = Utc::now();
    let old = (now - Duration::hours(48)).timestamp_millis();

    for _ in 0..(CLEANUP_BATCH + 20) {
        logs.append(&log_entry(InboundStatus::Processed, old)).await.unwrap();
    }

    assert_eq!(limiter.cleanup(now).await.unwrap(), CLEANUP_BATCH as u64);
    assert_eq!(limiter.cleanup(now).await.unwrap(), 20);
}
