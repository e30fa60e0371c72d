//! Document processing pipeline
//!
//! - [`state`]: the pure transition function and audit trail
//! - [`tasks`]: bounded worker pool with cached task results
//! - [`orchestrator`]: sequences upload through filing

pub mod orchestrator;
pub mod state;
pub mod tasks;

pub use orchestrator::{DocumentStatus, ExtractionReport, Pipeline, TaskOutput};
pub use state::{transition, AuditEntry, Guards, SideEffect, Transition, Trigger};
pub use tasks::{run_with_deadlines, TaskConfig, TaskId, TaskQueue, TaskStatus};
