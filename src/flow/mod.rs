/// Flow management layer
///
/// Flow definitions (one trigger + ordered steps) and their SQLite persistence.

// Core flow type definitions
pub mod types;

// SQLite persistence for flow documents
pub mod storage;

pub use storage::FlowStorage;
pub use types::{
    Flow, FlowStatus, NodeSpec, ScheduleMeta, TriggerKind, TriggerSpec, EMAIL_TRIGGER, INTERVAL_TRIGGER,
    SCHEDULE_TRIGGER,
};
