/// flowkeeper: flow trigger-activation and execution engine
///
/// Arms time and email triggers for user-authored flows, receives their fire events
/// and runs each flow's steps in order with per-step logging.

// Core configuration and setup
pub mod config;

// Coded error taxonomy shared by every component
pub mod error;

// SQLite pool and schema bootstrap
pub mod database;

// Flow definitions and their storage
pub mod flow;

// Node registry and execution orchestrator
pub mod runtime;

// Job Scheduler contract and its backends
pub mod scheduler;

// Trigger activation manager and activators
pub mod activation;

// Inbound email normalization, filtering and rate limiting
pub mod inbound;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use activation::{ActivationManager, ActivationOutcome};
pub use error::{EngineError, EngineResult};
pub use flow::{Flow, FlowStatus, NodeSpec};
pub use runtime::{ExecutionOrchestrator, NodeRegistry, StepExecutor};
pub use server::start_server;
