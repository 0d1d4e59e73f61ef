//! Workflow execution engine for camshaft.
//!
//! This crate drives declaratively specified workflows (directed graphs of
//! jobs made of ordered steps) with at-most-once dispatch semantics:
//!
//! - **Run Coordinator**: idempotent run creation and concurrency-group
//!   admission
//! - **Scheduler**: priority queues of ready jobs with dependency gating
//! - **Worker**: lease-guarded dispatch loop with heartbeats and crash
//!   recovery
//! - **Job Runner**: the job/step state machine with timeouts, retries,
//!   conditional steps, artifact handoff and sub-workflow invocation
//! - **Event Bridge**: buffered, rate-limited per-run event streams
//! - **Snapshot/Replay**: point-in-time capture for diagnostic replay

pub mod api;
pub mod artifacts;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod lease;
pub mod registry;
pub mod run;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod snapshot;
pub mod spec;
pub mod state;
pub mod worker;

pub use api::{Engine, EngineConfig};
pub use coordinator::{Admission, CoordinatorConfig, CreateRunInput, RunCoordinator};
pub use error::{CoordinatorError, EngineError, ErrorInfo};
pub use events::{EventBridge, EventBridgeConfig, RunEvent};
pub use executor::{
    ExecutorRegistry, SecretsProvider, StepContext, StepExecutor, StepOutcome, StepRequest,
};
pub use run::{JobRun, Run, RunStatus, StepRun};
pub use runner::{DispatchOutcome, JobRunner, RunnerConfig, RunnerDeps};
pub use scheduler::{JobScheduler, QueueEntry, SchedulerConfig};
pub use spec::{JobSpec, StepSpec, UsesRef, WorkflowSpec};
pub use state::StateStore;
pub use worker::{Worker, WorkerMetrics, WorkerOptions, create_workflow_worker};
