/// Runtime Execution Engine
///
/// This module runs fired flows. It handles:
/// - Node registry dispatch on `node_id`
/// - Sequential trigger/step execution with a shared result accumulator
/// - Per-run and per-step logging with failure short-circuiting

// Node id -> executor mapping and the executor contract
pub mod registry;

// Built-in trigger nodes and the http-request action
pub mod nodes;

// Run and step log persistence
pub mod logs;

// Sequential flow execution
pub mod orchestrator;

pub use logs::{ExecutionLog, ExecutionLogStorage, RunStatus, StepLog};
pub use orchestrator::{ExecutionOrchestrator, ExecutionRequest, RunReport};
pub use registry::{NodeRegistry, PriorResults, RunContext, StepExecutor};
