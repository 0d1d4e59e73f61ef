//! The job runner state machine.
//!
//! Drives a single job through its lifecycle under a composed cancellation
//! signal:
//!
//! 1. load the snapshot for the queue entry; stale entries are skipped
//! 2. transition job (and, first time, the run) to `running`
//! 3. run `pre` hooks, the main step sequence, outcome hooks, `post` hooks
//! 4. on failure, apply the retry policy; on abort, reset the job to
//!    `queued`; on success, capture artifacts and release dependents
//! 5. after any terminal job transition, finalize the run when every job
//!    is terminal
//!
//! The attempt counter counts dispatch attempts: it is incremented when a
//! job transitions `queued` → `running`, and abort recovery rolls back
//! exactly the increment its own dispatch performed, so lease losses and
//! worker shutdowns never consume the retry budget.

mod finalize;
mod hooks;
mod steps;
mod subflow;

use crate::artifacts::ArtifactStore;
use crate::coordinator::RunCoordinator;
use crate::error::{ErrorInfo, StateStoreError, codes};
use crate::events::{EventBridge, RunEvent};
use crate::executor::{ExecutorRegistry, SecretsProvider};
use crate::expr::ExprContext;
use crate::lease::LeaseManager;
use crate::registry::WorkflowRegistry;
use crate::run::{JobRun, JobStatus, Run, RunStatus, StepStatus};
use crate::scheduler::{JobScheduler, QueueEntry};
use crate::signal::{AbortCause, CancelSignal};
use crate::spec::{BackoffKind, RetryPolicy};
use crate::state::StateStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub(crate) use steps::StepsResult;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Sub-workflow nesting cap.
    pub max_workflow_depth: u32,
    /// How often a parent polls its child run.
    pub subflow_poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workflow_depth: 2,
            subflow_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Everything the runner needs to drive a job.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: StateStore,
    pub events: EventBridge,
    pub scheduler: JobScheduler,
    pub coordinator: RunCoordinator,
    pub leases: LeaseManager,
    pub executors: ExecutorRegistry,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub registry: Option<Arc<dyn WorkflowRegistry>>,
    pub secrets: Arc<dyn SecretsProvider>,
}

/// What the worker should do with the queue entry after a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The job reached a terminal status; enqueue any released dependents.
    Completed { released: Vec<JobRun> },
    /// The job failed and has retry budget left; requeue after the delay.
    Retry { delay_ms: u64 },
    /// The job was aborted and reset to `queued`; requeue shortly.
    Aborted,
    /// The entry was stale; nothing to requeue.
    Skipped,
}

/// Drives single jobs through their state machine.
#[derive(Clone)]
pub struct JobRunner {
    deps: RunnerDeps,
    config: RunnerConfig,
}

impl JobRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(deps: RunnerDeps, config: RunnerConfig) -> Self {
        Self { deps, config }
    }

    pub(crate) fn deps(&self) -> &RunnerDeps {
        &self.deps
    }

    pub(crate) fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Dispatches one queue entry under the worker's cancellation signal.
    pub async fn dispatch(
        &self,
        entry: &QueueEntry,
        signal: &CancelSignal,
    ) -> Result<DispatchOutcome, StateStoreError> {
        // Pre-dispatch checks against the current snapshot.
        let Some(run) = self.deps.store.get_run(entry.run_id).await? else {
            tracing::warn!(run_id = %entry.run_id, "queue entry for missing run, skipping");
            return Ok(DispatchOutcome::Skipped);
        };
        if run.status.is_terminal() {
            return Ok(DispatchOutcome::Skipped);
        }
        let Some(job_snapshot) = run.job(&entry.job_id) else {
            tracing::warn!(job_id = %entry.job_id, "queue entry for missing job, skipping");
            return Ok(DispatchOutcome::Skipped);
        };
        if !job_snapshot.status.is_dispatchable() {
            tracing::debug!(
                job_id = %entry.job_id,
                status = ?job_snapshot.status,
                "job no longer dispatchable, skipping"
            );
            return Ok(DispatchOutcome::Skipped);
        }

        // Arm the job timeout onto the composed signal.
        let timeout_guard = job_snapshot.timeout_ms.map(|timeout_ms| {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = signal.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                        signal.trigger(AbortCause::JobTimeout);
                    }
                }
            })
        });

        let outcome = self.dispatch_inner(entry, &run, signal).await;

        if let Some(guard) = timeout_guard {
            guard.abort();
        }
        outcome
    }

    async fn dispatch_inner(
        &self,
        entry: &QueueEntry,
        run: &Run,
        signal: &CancelSignal,
    ) -> Result<DispatchOutcome, StateStoreError> {
        let run_id = entry.run_id;

        // Start: transition the job to running. A fresh `queued` dispatch
        // counts as an attempt; re-entry of a `running` job does not.
        let mut fresh_attempt = false;
        let Some(job) = self
            .deps
            .store
            .update_job(run_id, &entry.job_id, |job| {
                fresh_attempt = job.status == JobStatus::Queued;
                job.status = JobStatus::Running;
                if job.started_at.is_none() {
                    job.started_at = Some(Utc::now());
                }
                job.finished_at = None;
                job.duration_ms = None;
                job.error = None;
                if fresh_attempt {
                    job.attempt += 1;
                }
            })
            .await?
        else {
            return Ok(DispatchOutcome::Skipped);
        };

        // First job to start moves the run to running.
        if run.status == RunStatus::Queued {
            let started = self
                .deps
                .store
                .update_run(run_id, |run| {
                    if run.status == RunStatus::Queued {
                        run.start();
                    }
                })
                .await?;
            if started.is_some_and(|r| r.status == RunStatus::Running) {
                self.deps.events.publish(RunEvent::RunStarted {
                    run_id,
                    timestamp: Utc::now(),
                });
            }
        }
        self.deps.events.publish(RunEvent::JobStarted {
            run_id,
            job_id: job.id.clone(),
            attempt: job.attempt,
            timestamp: Utc::now(),
        });

        // Expression context starts from run+job env and the outputs of
        // steps that already succeeded (crash re-entry).
        let mut ctx = ExprContext {
            env: run
                .env
                .iter()
                .chain(job.env.iter())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            trigger: Some(run.trigger.clone()),
            steps: Default::default(),
            matrix: None,
        };
        for step in &job.steps {
            if step.status == StepStatus::Success
                && let Some(outputs) = &step.outputs
            {
                ctx.cache_step_outputs(step.user_id.as_deref(), outputs);
            }
        }

        hooks::run_hook_phase(self, run, &job, "pre", &job.hooks.pre, &mut ctx, signal).await;

        let main = steps::run_main_steps(self, run, &job, &mut ctx, signal).await?;

        match &main {
            StepsResult::Success => {
                hooks::run_hook_phase(
                    self,
                    run,
                    &job,
                    "onSuccess",
                    &job.hooks.on_success,
                    &mut ctx,
                    signal,
                )
                .await;
            }
            StepsResult::Failed(_) => {
                hooks::run_hook_phase(
                    self,
                    run,
                    &job,
                    "onFailure",
                    &job.hooks.on_failure,
                    &mut ctx,
                    signal,
                )
                .await;
            }
            StepsResult::Cancelled => {}
        }
        hooks::run_hook_phase(self, run, &job, "post", &job.hooks.post, &mut ctx, signal).await;

        match main {
            StepsResult::Success => {
                steps::capture_job_artifacts(self, run_id, &job).await?;
                finalize::finalize_job_success(self, run_id, &job).await
            }
            StepsResult::Failed(error) => self.decide_retry(run_id, &job, error).await,
            StepsResult::Cancelled => match signal.cause() {
                Some(AbortCause::JobTimeout) => {
                    let error = ErrorInfo::coded(
                        codes::JOB_TIMEOUT,
                        format!(
                            "job exceeded its timeout of {}ms",
                            job.timeout_ms.unwrap_or_default()
                        ),
                    );
                    self.decide_retry(run_id, &job, error).await
                }
                Some(AbortCause::WorkerShutdown | AbortCause::LeaseLost) | None => {
                    self.recover_abort(run_id, &job, fresh_attempt).await
                }
                Some(AbortCause::RunCancelled) => {
                    finalize::finalize_job_cancelled(self, run_id, &job).await
                }
            },
        }
    }

    /// Applies the retry policy to a failed attempt.
    async fn decide_retry(
        &self,
        run_id: camshaft_core::RunId,
        job: &JobRun,
        error: ErrorInfo,
    ) -> Result<DispatchOutcome, StateStoreError> {
        let retry_allowed = error.is_retryable() && job.attempt <= job.retry.max;
        if !retry_allowed {
            return finalize::finalize_job_failed(self, run_id, job, error).await;
        }

        let delay_ms = next_retry_delay(&job.retry, job.attempt);
        let updated = self
            .deps
            .store
            .update_job(run_id, &job.id, |job| {
                // Back to the queue with the attempt counter intact; steps
                // start fresh on the next attempt.
                let attempt = job.attempt;
                job.reset_to_queued();
                job.attempt = attempt;
                job.error = Some(error.clone());
            })
            .await?;
        if updated.is_none() {
            return Ok(DispatchOutcome::Skipped);
        }

        self.deps.events.publish(RunEvent::JobQueued {
            run_id,
            job_id: job.id.clone(),
            attempt: job.attempt,
            retry_delay_ms: delay_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            job_id = %job.id,
            attempt = job.attempt,
            delay_ms,
            "job failed, retry scheduled"
        );
        Ok(DispatchOutcome::Retry { delay_ms })
    }

    /// Resets an aborted job to `queued` so another worker can pick it up.
    ///
    /// `incremented_attempt` says whether this dispatch performed the
    /// `queued` → `running` increment; only then is it rolled back. A
    /// re-entered `running` job never incremented on this cycle, so an
    /// abort there must not hand the job extra retry budget.
    async fn recover_abort(
        &self,
        run_id: camshaft_core::RunId,
        job: &JobRun,
        incremented_attempt: bool,
    ) -> Result<DispatchOutcome, StateStoreError> {
        let mut outcome = DispatchOutcome::Aborted;
        let updated = self
            .deps
            .store
            .update_run(run_id, |run| {
                if run.status.is_terminal() {
                    // The run was terminalized (e.g. cancelled) while we
                    // were aborting; leave its state alone.
                    outcome = DispatchOutcome::Skipped;
                    return;
                }
                if let Some(job) = run.job_mut(&job.id) {
                    let attempt = job.attempt;
                    job.reset_to_queued();
                    // The aborted dispatch is not an attempt.
                    job.attempt = if incremented_attempt {
                        attempt.saturating_sub(1)
                    } else {
                        attempt
                    };
                }
            })
            .await?;
        if updated.is_none() {
            return Ok(DispatchOutcome::Skipped);
        }
        tracing::info!(job_id = %job.id, "job aborted, reset to queued");
        Ok(outcome)
    }
}

/// Computes the delay before retry number `attempt` + 1.
///
/// `attempt` is the number of completed attempts; the zero-based index of
/// the attempt that just failed is `attempt - 1`.
fn next_retry_delay(policy: &RetryPolicy, attempt: u32) -> u64 {
    let n = attempt.saturating_sub(1);
    let delay = match policy.backoff {
        BackoffKind::Exp => policy
            .initial_interval_ms
            .saturating_mul(2u64.saturating_pow(n)),
        BackoffKind::Lin => policy.initial_interval_ms.saturating_mul(u64::from(n) + 1),
    };
    match policy.max_interval_ms {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}
