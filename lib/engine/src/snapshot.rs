//! Snapshot and replay.
//!
//! A snapshot is a point-in-time copy of a run's execution state (the run
//! tree, cached step outputs and the effective environment) kept for
//! diagnostic replay. Replay restores the run to `running`, marks steps
//! before a chosen point `success` and resets the rest to `queued`, then
//! re-enqueues the restored run.

use crate::error::StateStoreError;
use crate::run::{JobStatus, Run, RunStatus, StepStatus};
use crate::scheduler::JobScheduler;
use crate::state::StateStore;
use camshaft_core::{RunId, StepRunId};
use camshaft_store::{Envelope, StoreBackend, keys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    /// The captured run tree.
    pub run: Run,
    /// Cached step outputs, keyed by step user id.
    pub step_outputs: HashMap<String, BTreeMap<String, JsonValue>>,
    /// The effective environment at capture time.
    pub env: BTreeMap<String, String>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Snapshot format version.
    pub version: u32,
}

/// Options for replaying a snapshotted run.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Replay from this step: everything strictly before it is marked
    /// `success`, it and everything after reset to `queued`. When unset,
    /// every step is reset.
    pub from_step_id: Option<StepRunId>,
    /// Step outputs overriding the snapshot's cache.
    pub step_outputs: Option<HashMap<String, BTreeMap<String, JsonValue>>>,
    /// Environment overrides merged over the snapshot's env.
    pub env: Option<BTreeMap<String, String>>,
}

/// Stores and restores run snapshots.
#[derive(Clone)]
pub struct SnapshotStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl SnapshotStore {
    /// Default snapshot lifetime (7 days).
    pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Creates a snapshot store with the given TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Captures a snapshot of a run.
    pub async fn create_snapshot(
        &self,
        run: &Run,
        step_outputs: HashMap<String, BTreeMap<String, JsonValue>>,
        env: BTreeMap<String, String>,
    ) -> Result<(), StateStoreError> {
        let snapshot = RunSnapshot {
            run: run.clone(),
            step_outputs,
            env,
            created_at: Utc::now(),
            version: SNAPSHOT_VERSION,
        };
        let key = keys::snapshot(&run.id);
        let encoded = Envelope::new(&snapshot)
            .encode()
            .map_err(|e| StateStoreError::corrupt(&key, &e))?;
        self.backend.set(&key, &encoded, Some(self.ttl)).await?;
        Ok(())
    }

    /// Loads the snapshot of a run, if one exists.
    pub async fn load(&self, run_id: RunId) -> Result<Option<RunSnapshot>, StateStoreError> {
        let key = keys::snapshot(&run_id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let snapshot =
            Envelope::decode_current(&raw).map_err(|e| StateStoreError::corrupt(&key, &e))?;
        Ok(Some(snapshot))
    }
}

/// Restores a snapshotted run and re-enqueues it.
///
/// Returns the restored run, or `None` when no snapshot exists.
pub async fn replay_run(
    snapshots: &SnapshotStore,
    store: &StateStore,
    scheduler: &JobScheduler,
    run_id: RunId,
    options: ReplayOptions,
) -> Result<Option<Run>, StateStoreError> {
    let Some(snapshot) = snapshots.load(run_id).await? else {
        return Ok(None);
    };

    let mut run = snapshot.run;
    let mut outputs = snapshot.step_outputs;
    if let Some(overrides) = options.step_outputs {
        outputs.extend(overrides);
    }
    if let Some(env) = options.env {
        run.env.extend(env);
    }

    run.status = RunStatus::Running;
    run.finished_at = None;
    run.duration_ms = None;
    run.result = None;

    // Walk steps in global order (jobs in declaration order, steps by
    // index) and split the run at the chosen step.
    let mut before_target = options.from_step_id.is_some();
    for job in &mut run.jobs {
        for step in &mut job.steps {
            if options.from_step_id.as_ref() == Some(&step.id) {
                before_target = false;
            }
            if before_target {
                step.status = StepStatus::Success;
                if step.outputs.is_none()
                    && let Some(cached) = step.user_id.as_ref().and_then(|id| outputs.get(id))
                {
                    step.outputs = Some(cached.clone());
                }
            } else {
                step.reset_to_queued();
            }
        }

        let all_success = job
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Success);
        if all_success && !job.steps.is_empty() {
            job.status = JobStatus::Success;
        } else {
            job.status = JobStatus::Queued;
            job.started_at = None;
            job.finished_at = None;
            job.duration_ms = None;
            job.error = None;
        }
    }

    // Recompute dependency gating from the restored job statuses.
    let succeeded: Vec<String> = run
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Success)
        .map(|job| job.name.clone())
        .collect();
    for job in &mut run.jobs {
        if job.status != JobStatus::Queued {
            continue;
        }
        job.pending_dependencies = job
            .needs
            .iter()
            .filter(|needed| !succeeded.contains(needed))
            .cloned()
            .collect();
        job.blocked = !job.pending_dependencies.is_empty();
    }

    store.save_run(&run).await?;
    let enqueued = scheduler.schedule_run(&run).await?;
    tracing::info!(run_id = %run_id, enqueued, "run restored from snapshot");
    Ok(Some(run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunMetadata, TriggerInfo};
    use crate::scheduler::SchedulerConfig;
    use crate::spec::WorkflowSpec;
    use camshaft_store::MemoryStore;

    struct Fixture {
        snapshots: SnapshotStore,
        store: StateStore,
        scheduler: JobScheduler,
    }

    fn fixture() -> Fixture {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
        Fixture {
            snapshots: SnapshotStore::new(Arc::clone(&backend), SnapshotStore::DEFAULT_TTL),
            store: StateStore::new(Arc::clone(&backend)),
            scheduler: JobScheduler::new(backend, SchedulerConfig::default()),
        }
    }

    fn finished_run() -> Run {
        let spec: WorkflowSpec = serde_json::from_value(serde_json::json!({
            "name": "wf",
            "jobs": [{
                "name": "build",
                "steps": [
                    { "id": "fetch", "uses": "builtin:shell" },
                    { "id": "compile", "uses": "builtin:shell" },
                    { "id": "package", "uses": "builtin:shell" }
                ]
            }]
        }))
        .expect("valid spec");
        let mut run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(None),
            RunMetadata::default(),
            &BTreeMap::new(),
        );
        run.start();
        for step in &mut run.jobs[0].steps {
            step.status = StepStatus::Failed;
        }
        run.jobs[0].status = JobStatus::Failed;
        let result = run.build_result(RunStatus::Failed);
        run.finish(RunStatus::Failed, result);
        run
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let fx = fixture();
        let run = finished_run();
        fx.snapshots
            .create_snapshot(&run, HashMap::new(), run.env.clone())
            .await
            .unwrap();

        let loaded = fx.snapshots.load(run.id).await.unwrap().expect("present");
        assert_eq!(loaded.run, run);
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert!(fx.snapshots.load(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_without_target_resets_everything() {
        let fx = fixture();
        let run = finished_run();
        fx.snapshots
            .create_snapshot(&run, HashMap::new(), run.env.clone())
            .await
            .unwrap();

        let restored = replay_run(
            &fx.snapshots,
            &fx.store,
            &fx.scheduler,
            run.id,
            ReplayOptions::default(),
        )
        .await
        .unwrap()
        .expect("snapshot present");

        assert_eq!(restored.status, RunStatus::Running);
        assert!(restored.finished_at.is_none());
        assert_eq!(restored.jobs[0].status, JobStatus::Queued);
        assert!(
            restored.jobs[0]
                .steps
                .iter()
                .all(|step| step.status == StepStatus::Queued)
        );

        // The restored job is back in the ready queue.
        let entry = fx.scheduler.dequeue_job().await.unwrap().expect("queued");
        assert_eq!(entry.run_id, run.id);
    }

    #[tokio::test]
    async fn replay_from_step_splits_the_run() {
        let fx = fixture();
        let run = finished_run();
        let target = run.jobs[0].steps[1].id.clone();
        let outputs: HashMap<String, BTreeMap<String, JsonValue>> = [(
            "fetch".to_string(),
            [("rev".to_string(), serde_json::json!("abc123"))]
                .into_iter()
                .collect(),
        )]
        .into_iter()
        .collect();
        fx.snapshots
            .create_snapshot(&run, outputs, run.env.clone())
            .await
            .unwrap();

        let restored = replay_run(
            &fx.snapshots,
            &fx.store,
            &fx.scheduler,
            run.id,
            ReplayOptions {
                from_step_id: Some(target),
                ..ReplayOptions::default()
            },
        )
        .await
        .unwrap()
        .expect("snapshot present");

        let steps = &restored.jobs[0].steps;
        assert_eq!(steps[0].status, StepStatus::Success);
        // Replayed-over steps regain their cached outputs for expressions.
        assert_eq!(
            steps[0].outputs.as_ref().and_then(|o| o.get("rev")),
            Some(&serde_json::json!("abc123"))
        );
        assert_eq!(steps[1].status, StepStatus::Queued);
        assert_eq!(steps[2].status, StepStatus::Queued);
        assert_eq!(restored.jobs[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn replay_missing_snapshot_is_none() {
        let fx = fixture();
        let restored = replay_run(
            &fx.snapshots,
            &fx.store,
            &fx.scheduler,
            RunId::new(),
            ReplayOptions::default(),
        )
        .await
        .unwrap();
        assert!(restored.is_none());
    }
}
