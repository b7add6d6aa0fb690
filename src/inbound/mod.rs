/// Inbound Email Triggers
///
/// This module turns provider webhooks into flow executions. It handles:
/// - v1/v2 payload normalization into one canonical email record
/// - Trigger Record and inbound log persistence
/// - Rolling hourly/daily rate limits with bounded log cleanup
/// - Per-recipient resolution, filtering and enqueueing

pub mod normalize;
pub mod processor;
pub mod rate_limit;
pub mod storage;

pub use normalize::{InboundEmail, NormalizeError};
pub use processor::{InboundEmailProcessor, RecipientResult, WebhookResponse};
pub use rate_limit::{RateDecision, RateLimiter};
pub use storage::{
    InboundLogEntry, InboundLogStorage, InboundStatus, TriggerRecord, TriggerSettings, TriggerStatus, TriggerStorage,
};
