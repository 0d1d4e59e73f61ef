//! Run cancellation.
//!
//! Cancelling a run marks the run and every non-terminal job/step
//! `cancelled`, publishes the terminal event, revokes the leases of jobs
//! that were running (so in-flight workers observe the loss on their next
//! heartbeat and abort), and releases the concurrency group. Shared by the
//! submission API and the sub-workflow runner, which cancels its child when
//! the parent is cancelled.

use crate::error::StateStoreError;
use crate::events::{EventBridge, RunEvent};
use crate::lease::LeaseManager;
use crate::run::{JobStatus, Run, RunStatus, StepStatus};
use crate::state::StateStore;
use camshaft_core::RunId;
#[cfg(test)]
use camshaft_store::StoreBackend;
use camshaft_store::keys;
use chrono::Utc;

/// Cancels a run.
///
/// Idempotent: a run that is already terminal is returned unchanged.
/// Returns `None` when the run does not exist.
pub async fn cancel_run(
    store: &StateStore,
    events: &EventBridge,
    leases: &LeaseManager,
    run_id: RunId,
    reason: Option<String>,
) -> Result<Option<Run>, StateStoreError> {
    let Some(current) = store.get_run(run_id).await? else {
        return Ok(None);
    };
    if current.status.is_terminal() {
        return Ok(Some(current));
    }

    let mut was_running: Vec<_> = Vec::new();
    let updated = store
        .update_run(run_id, |run| {
            for job in &mut run.jobs {
                if job.status.is_terminal() {
                    continue;
                }
                if job.status == JobStatus::Running {
                    was_running.push(job.id.clone());
                }
                for step in &mut job.steps {
                    if !step.status.is_terminal() {
                        step.status = StepStatus::Cancelled;
                        step.stamp_finished();
                    }
                }
                job.finish(JobStatus::Cancelled, None);
            }
            let result = run.build_result(RunStatus::Cancelled);
            run.finish(RunStatus::Cancelled, result);
        })
        .await?;
    let Some(run) = updated else {
        return Ok(None);
    };

    // In-flight workers learn about the cancellation through their lease
    // heartbeat.
    for job_id in &was_running {
        if let Err(e) = leases.revoke(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to revoke lease on cancel");
        }
    }

    if let Some(group) = &run.metadata.concurrency_group {
        let released = store
            .backend()
            .delete_if_equals(&keys::concurrency(group), &run.id.to_string())
            .await;
        if let Err(e) = released {
            tracing::warn!(group = %group, error = %e, "failed to release concurrency group");
        }
    }

    events.publish(RunEvent::RunCancelled {
        run_id,
        reason,
        timestamp: Utc::now(),
    });
    tracing::info!(run_id = %run_id, "run cancelled");
    Ok(Some(run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBridgeConfig;
    use crate::run::{RunMetadata, TriggerInfo};
    use crate::spec::WorkflowSpec;
    use camshaft_store::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<MemoryStore>,
        store: StateStore,
        events: EventBridge,
        leases: LeaseManager,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryStore::new());
        let store_backend: Arc<dyn StoreBackend> = backend.clone();
        Fixture {
            backend,
            store: StateStore::new(store_backend.clone()),
            events: EventBridge::new(store_backend.clone(), EventBridgeConfig::default()),
            leases: LeaseManager::new(store_backend, Duration::from_secs(15)),
        }
    }

    fn running_run() -> Run {
        let spec: WorkflowSpec = serde_json::from_value(serde_json::json!({
            "name": "wf",
            "jobs": [
                { "name": "a", "steps": [{ "uses": "builtin:shell" }] },
                { "name": "b", "needs": ["a"], "steps": [{ "uses": "builtin:shell" }] }
            ]
        }))
        .expect("valid spec");
        let mut run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(None),
            RunMetadata {
                concurrency_group: Some("deploy".to_string()),
                ..RunMetadata::default()
            },
            &BTreeMap::new(),
        );
        run.start();
        run.jobs[0].status = JobStatus::Running;
        run.jobs[0].started_at = Some(Utc::now());
        run.jobs[0].steps[0].status = StepStatus::Running;
        run
    }

    #[tokio::test]
    async fn cancel_marks_everything_and_releases_resources() {
        let fx = fixture();
        let run = running_run();
        fx.store.save_run(&run).await.unwrap();
        fx.backend
            .set(&keys::concurrency(&"deploy"), &run.id.to_string(), None)
            .await
            .unwrap();
        let owner = "wkr_x:token";
        fx.backend
            .set(&keys::job_lease(&run.jobs[0].id), owner, None)
            .await
            .unwrap();

        let cancelled = cancel_run(&fx.store, &fx.events, &fx.leases, run.id, None)
            .await
            .unwrap()
            .expect("present");

        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
        assert!(cancelled.jobs.iter().all(|j| j.status == JobStatus::Cancelled));
        assert!(
            cancelled.jobs[0]
                .steps
                .iter()
                .all(|s| s.status == StepStatus::Cancelled)
        );
        let result = cancelled.result.expect("result");
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.metrics.jobs_cancelled, 2);

        // Lease revoked, group released.
        assert_eq!(
            fx.backend.get(&keys::job_lease(&run.jobs[0].id)).await.unwrap(),
            None
        );
        assert_eq!(fx.backend.get(&keys::concurrency(&"deploy")).await.unwrap(), None);

        // Terminal event published.
        fx.events.flush().await.unwrap();
        let history = fx.events.export(run.id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|e| matches!(e, RunEvent::RunCancelled { .. }))
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_runs() {
        let fx = fixture();
        let run = running_run();
        fx.store.save_run(&run).await.unwrap();

        let first = cancel_run(&fx.store, &fx.events, &fx.leases, run.id, None)
            .await
            .unwrap()
            .expect("present");
        let second = cancel_run(&fx.store, &fx.events, &fx.leases, run.id, None)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(first.finished_at, second.finished_at);

        assert!(
            cancel_run(&fx.store, &fx.events, &fx.leases, RunId::new(), None)
                .await
                .unwrap()
                .is_none()
        );
    }
}
