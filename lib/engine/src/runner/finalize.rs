//! Job finalization, dependency release and run finalization.
//!
//! After any terminal job transition the run is checked for completion:
//! once every job is terminal the run's status is derived (failed beats
//! cancelled beats success), the execution result is built, the
//! concurrency group is released and the terminal event is published.
//!
//! Only a `success` transition releases dependents; failed dependencies
//! leave their dependents blocked until the caller cancels the run.

use super::{DispatchOutcome, JobRunner};
use crate::error::{ErrorInfo, StateStoreError};
use crate::events::RunEvent;
use crate::run::{JobRun, JobStatus, RunStatus, StepStatus};
use camshaft_core::RunId;
use chrono::Utc;

pub(super) async fn finalize_job_success(
    runner: &JobRunner,
    run_id: RunId,
    job: &JobRun,
) -> Result<DispatchOutcome, StateStoreError> {
    let deps = runner.deps();
    let updated = deps
        .store
        .update_job(run_id, &job.id, |job| {
            job.finish(JobStatus::Success, None);
        })
        .await?;
    if updated.is_none() {
        return Ok(DispatchOutcome::Skipped);
    }
    deps.events.publish(RunEvent::JobSuccess {
        run_id,
        job_id: job.id.clone(),
        timestamp: Utc::now(),
    });
    tracing::info!(job_id = %job.id, "job succeeded");

    let released = deps.store.release_blocked_jobs(run_id, &job.name).await?;
    finalize_run_if_complete(runner, run_id).await?;
    Ok(DispatchOutcome::Completed { released })
}

pub(super) async fn finalize_job_failed(
    runner: &JobRunner,
    run_id: RunId,
    job: &JobRun,
    error: ErrorInfo,
) -> Result<DispatchOutcome, StateStoreError> {
    let deps = runner.deps();
    let updated = deps
        .store
        .update_job(run_id, &job.id, |job| {
            // Steps the failure never reached are settled as skipped so a
            // terminal job never carries queued steps.
            for step in &mut job.steps {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Skipped;
                    step.skip_reason = Some("an earlier step failed".to_string());
                }
            }
            job.finish(JobStatus::Failed, Some(error.clone()));
        })
        .await?;
    if updated.is_none() {
        return Ok(DispatchOutcome::Skipped);
    }
    deps.events.publish(RunEvent::JobFailed {
        run_id,
        job_id: job.id.clone(),
        error: Some(error.clone()),
        timestamp: Utc::now(),
    });
    tracing::warn!(job_id = %job.id, error = %error, "job failed");

    finalize_run_if_complete(runner, run_id).await?;
    Ok(DispatchOutcome::Completed { released: Vec::new() })
}

pub(super) async fn finalize_job_cancelled(
    runner: &JobRunner,
    run_id: RunId,
    job: &JobRun,
) -> Result<DispatchOutcome, StateStoreError> {
    let deps = runner.deps();
    let updated = deps
        .store
        .update_job(run_id, &job.id, |job| {
            for step in &mut job.steps {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Cancelled;
                    step.stamp_finished();
                }
            }
            job.finish(JobStatus::Cancelled, None);
        })
        .await?;
    if updated.is_none() {
        return Ok(DispatchOutcome::Skipped);
    }
    deps.events.publish(RunEvent::JobCancelled {
        run_id,
        job_id: job.id.clone(),
        timestamp: Utc::now(),
    });
    tracing::info!(job_id = %job.id, "job cancelled");

    finalize_run_if_complete(runner, run_id).await?;
    Ok(DispatchOutcome::Completed { released: Vec::new() })
}

/// Derives and persists the run's terminal status once every job is
/// terminal.
pub(super) async fn finalize_run_if_complete(
    runner: &JobRunner,
    run_id: RunId,
) -> Result<(), StateStoreError> {
    let deps = runner.deps();
    let mut terminal: Option<RunStatus> = None;
    let updated = deps
        .store
        .update_run(run_id, |run| {
            if run.status.is_terminal() || !run.all_jobs_terminal() {
                return;
            }
            let status = if run.jobs.iter().any(|j| j.status == JobStatus::Failed) {
                RunStatus::Failed
            } else if run.jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
                RunStatus::Cancelled
            } else {
                RunStatus::Success
            };
            let result = run.build_result(status);
            run.finish(status, result);
            terminal = Some(status);
        })
        .await?;

    let (Some(run), Some(status)) = (updated, terminal) else {
        return Ok(());
    };

    if let Err(e) = deps.coordinator.release_concurrency(&run).await {
        tracing::warn!(run_id = %run_id, error = %e, "failed to release concurrency group");
    }
    let error = run.result.as_ref().and_then(|result| result.error.clone());
    deps.events
        .publish(RunEvent::run_terminal(run_id, status, error));
    tracing::info!(run_id = %run_id, status = ?status, "run finalized");
    Ok(())
}
