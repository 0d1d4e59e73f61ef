//! The in-process submission API.
//!
//! [`Engine`] wires the coordinator, state store, scheduler, event bridge
//! and snapshot store over one shared backend and exposes the verbs callers
//! use: submit, inspect, cancel, dequeue/requeue (for workers), finalize,
//! snapshot and replay. Everything is constructor-injected; there is no
//! module-level state.

use crate::artifacts::ArtifactStore;
use crate::control;
use crate::coordinator::{Admission, CoordinatorConfig, CreateRunInput, RunCoordinator};
use crate::error::{EngineError, ErrorInfo};
use crate::events::{EventBridge, EventBridgeConfig, RunEvent};
use crate::executor::{ExecutorRegistry, SecretsProvider};
use crate::lease::LeaseManager;
use crate::registry::WorkflowRegistry;
use crate::run::{JobStatus, Run, RunStatus, StepStatus, TriggerInfo};
use crate::runner::{JobRunner, RunnerConfig, RunnerDeps};
use crate::scheduler::{JobScheduler, QueueEntry, SchedulerConfig};
use crate::snapshot::{ReplayOptions, SnapshotStore, replay_run};
use crate::spec::WorkflowSpec;
use crate::state::StateStore;
use camshaft_core::RunId;
use camshaft_store::StoreBackend;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run admission (idempotency/concurrency TTLs).
    pub coordinator: CoordinatorConfig,
    /// Ready-queue behaviour.
    pub scheduler: SchedulerConfig,
    /// Event bridge behaviour.
    pub events: EventBridgeConfig,
    /// Snapshot lifetime.
    pub snapshot_ttl: Duration,
    /// Job lease lifetime (shared with workers built on this engine).
    pub lease_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            events: EventBridgeConfig::default(),
            snapshot_ttl: SnapshotStore::DEFAULT_TTL,
            lease_ttl: Duration::from_millis(15_000),
        }
    }
}

/// The engine facade.
#[derive(Clone)]
pub struct Engine {
    store: StateStore,
    coordinator: RunCoordinator,
    scheduler: JobScheduler,
    events: EventBridge,
    snapshots: SnapshotStore,
    leases: LeaseManager,
}

impl Engine {
    /// Builds an engine over a shared store backend.
    ///
    /// Must be called from within a tokio runtime (the event bridge spawns
    /// its flusher).
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, config: EngineConfig) -> Self {
        let store = StateStore::new(Arc::clone(&backend));
        Self {
            coordinator: RunCoordinator::new(store.clone(), config.coordinator),
            scheduler: JobScheduler::new(Arc::clone(&backend), config.scheduler),
            events: EventBridge::new(Arc::clone(&backend), config.events),
            snapshots: SnapshotStore::new(Arc::clone(&backend), config.snapshot_ttl),
            leases: LeaseManager::new(backend, config.lease_ttl),
            store,
        }
    }

    /// The engine's state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The engine's event bridge.
    #[must_use]
    pub fn events(&self) -> &EventBridge {
        &self.events
    }

    /// Builds a job runner sharing this engine's stores, for
    /// [`create_workflow_worker`](crate::worker::create_workflow_worker).
    #[must_use]
    pub fn runner(
        &self,
        executors: ExecutorRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Option<Arc<dyn WorkflowRegistry>>,
        secrets: Arc<dyn SecretsProvider>,
        config: RunnerConfig,
    ) -> JobRunner {
        JobRunner::new(
            RunnerDeps {
                store: self.store.clone(),
                events: self.events.clone(),
                scheduler: self.scheduler.clone(),
                coordinator: self.coordinator.clone(),
                leases: self.leases.clone(),
                executors,
                artifacts,
                registry,
                secrets,
            },
            config,
        )
    }

    /// Creates (or idempotently returns) a run and enqueues its unblocked
    /// jobs.
    pub async fn create_run(&self, input: CreateRunInput) -> Result<Run, EngineError> {
        let Admission { run, created } = self.coordinator.ensure_run(input).await?;
        if created {
            self.events.publish(RunEvent::RunQueued {
                run_id: run.id,
                timestamp: Utc::now(),
            });
            self.scheduler.schedule_run(&run).await?;
        }
        Ok(run)
    }

    /// Submits an already-parsed JSON spec.
    ///
    /// Author-facing YAML and schema validation live in the loader outside
    /// the engine; this entry point accepts the loader's output shape.
    pub async fn run_from_inline(
        &self,
        raw: JsonValue,
        trigger: TriggerInfo,
    ) -> Result<Run, EngineError> {
        let spec: WorkflowSpec =
            serde_json::from_value(raw).map_err(|e| EngineError::InvalidSpec {
                message: e.to_string(),
            })?;
        self.create_run(CreateRunInput::new(spec, trigger)).await
    }

    /// Submits a JSON spec file from disk.
    pub async fn run_from_file(
        &self,
        path: impl AsRef<Path>,
        trigger: TriggerInfo,
    ) -> Result<Run, EngineError> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| EngineError::InvalidSpec {
                message: format!("reading {}: {e}", path.as_ref().display()),
            })?;
        let value: JsonValue =
            serde_json::from_str(&raw).map_err(|e| EngineError::InvalidSpec {
                message: e.to_string(),
            })?;
        self.run_from_inline(value, trigger).await
    }

    /// Loads a run by id.
    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Lists the most recently created runs, newest first.
    pub async fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>, EngineError> {
        Ok(self.store.list_recent(limit).await?)
    }

    /// Cancels a run (idempotent).
    pub async fn cancel_run(
        &self,
        run_id: RunId,
        reason: Option<String>,
    ) -> Result<Option<Run>, EngineError> {
        Ok(control::cancel_run(&self.store, &self.events, &self.leases, run_id, reason).await?)
    }

    /// Applies a mutator to a run document.
    pub async fn update_run<F>(&self, run_id: RunId, mutate: F) -> Result<Option<Run>, EngineError>
    where
        F: FnOnce(&mut Run),
    {
        Ok(self.store.update_run(run_id, mutate).await?)
    }

    /// Claims the next dispatchable queue entry.
    pub async fn next_job(&self) -> Result<Option<QueueEntry>, EngineError> {
        Ok(self.scheduler.dequeue_job().await?)
    }

    /// Requeues an entry after a delay.
    pub async fn reschedule_job(
        &self,
        entry: &QueueEntry,
        delay_ms: u64,
    ) -> Result<(), EngineError> {
        Ok(self.scheduler.reschedule(entry, delay_ms).await?)
    }

    /// Forces a run to a terminal status, terminalizing its live jobs.
    ///
    /// An operator verb: the normal path derives terminal status from job
    /// outcomes.
    pub async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<ErrorInfo>,
    ) -> Result<Option<Run>, EngineError> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidSpec {
                message: format!("finalize_run requires a terminal status, got {status:?}"),
            });
        }
        let updated = self
            .store
            .update_run(run_id, |run| {
                if run.status.is_terminal() {
                    return;
                }
                for job in &mut run.jobs {
                    if job.status.is_terminal() {
                        continue;
                    }
                    for step in &mut job.steps {
                        if !step.status.is_terminal() {
                            step.status = StepStatus::Cancelled;
                            step.stamp_finished();
                        }
                    }
                    job.finish(JobStatus::Cancelled, None);
                }
                let mut result = run.build_result(status);
                result.error = result.error.or_else(|| error.clone());
                run.finish(status, result);
            })
            .await?;

        if let Some(run) = &updated {
            if let Err(e) = self.coordinator.release_concurrency(run).await {
                tracing::warn!(run_id = %run_id, error = %e, "failed to release concurrency group");
            }
            let error = run.result.as_ref().and_then(|result| result.error.clone());
            self.events
                .publish(RunEvent::run_terminal(run_id, status, error));
        }
        Ok(updated)
    }

    /// Captures a snapshot of a run's current state.
    pub async fn create_snapshot(&self, run_id: RunId) -> Result<Option<Run>, EngineError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        let mut step_outputs: HashMap<String, BTreeMap<String, JsonValue>> = HashMap::new();
        for job in &run.jobs {
            for step in &job.steps {
                if let (Some(user_id), Some(outputs)) = (&step.user_id, &step.outputs) {
                    step_outputs.insert(user_id.clone(), outputs.clone());
                }
            }
        }
        self.snapshots
            .create_snapshot(&run, step_outputs, run.env.clone())
            .await?;
        Ok(Some(run))
    }

    /// Restores a snapshotted run and re-enqueues it.
    pub async fn replay_run(
        &self,
        run_id: RunId,
        options: ReplayOptions,
    ) -> Result<Option<Run>, EngineError> {
        Ok(replay_run(&self.snapshots, &self.store, &self.scheduler, run_id, options).await?)
    }

    /// Reads events past a cursor.
    pub async fn read_events(
        &self,
        run_id: RunId,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, RunEvent)>, EngineError> {
        Ok(self.events.read(run_id, cursor, count).await?)
    }

    /// Reads a run's full event history.
    pub async fn export_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, EngineError> {
        Ok(self.events.export(run_id).await?)
    }

    /// Flushes buffered events and stops the bridge flusher.
    pub async fn shutdown(&self) {
        self.events.shutdown().await;
    }
}
