//! The main step execution loop.
//!
//! Steps run strictly in index order, at most one `running` per job. Each
//! iteration: cancellation check, `if` evaluation against the outputs of
//! preceding steps, transition to `running`, parameter interpolation,
//! dispatch to the executor under a step-level timeout, and outcome
//! persistence. A step that succeeded on an earlier entry of the same job
//! (crash re-entry) is not re-executed; its outputs are re-cached for later
//! expressions.

use super::{JobRunner, subflow};
use crate::artifacts::{capture_produced, merge_artifacts};
use crate::error::{ErrorInfo, StateStoreError, codes};
use crate::events::RunEvent;
use crate::executor::{StepContext, StepOutcome, StepRequest};
use crate::expr::{self, ExprContext};
use crate::run::{JobRun, Run, StepRun, StepStatus};
use crate::signal::CancelSignal;
use crate::spec::UsesRef;
use camshaft_core::RunId;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outcome of the main step sequence.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepsResult {
    Success,
    Failed(ErrorInfo),
    Cancelled,
}

enum StepFlow {
    Continue,
    Fail(ErrorInfo),
    Cancelled,
}

pub(super) async fn run_main_steps(
    runner: &JobRunner,
    run: &Run,
    job: &JobRun,
    ctx: &mut ExprContext,
    signal: &CancelSignal,
) -> Result<StepsResult, StateStoreError> {
    let deps = runner.deps();

    // Declared artifact merge runs first so the steps can consume the
    // merged file from their own root.
    if let Some(artifacts) = &job.artifacts
        && let Some(merge) = &artifacts.merge
    {
        let own = deps.artifacts.client_for(run.id, &job.name);
        if let Err(error) = merge_artifacts(deps.artifacts.as_ref(), run.id, merge, own.as_ref()).await
        {
            tracing::warn!(job_id = %job.id, error = %error, "artifact merge failed");
            return Ok(StepsResult::Failed(error));
        }
    }

    for step in &job.steps {
        match step.status {
            StepStatus::Success => {
                if let Some(outputs) = &step.outputs {
                    ctx.cache_step_outputs(step.user_id.as_deref(), outputs);
                }
                continue;
            }
            StepStatus::Skipped => continue,
            _ => {}
        }
        match execute_step(runner, run, job, step, ctx, signal).await? {
            StepFlow::Continue => {}
            StepFlow::Fail(error) => return Ok(StepsResult::Failed(error)),
            StepFlow::Cancelled => return Ok(StepsResult::Cancelled),
        }
    }
    Ok(StepsResult::Success)
}

async fn execute_step(
    runner: &JobRunner,
    run: &Run,
    job: &JobRun,
    step: &StepRun,
    ctx: &mut ExprContext,
    signal: &CancelSignal,
) -> Result<StepFlow, StateStoreError> {
    let deps = runner.deps();
    let run_id = run.id;

    if signal.is_cancelled() {
        return Ok(StepFlow::Cancelled);
    }

    // Conditional: a false condition skips, a malformed one fails the step.
    if let Some(condition) = &step.spec.r#if {
        match expr::evaluate_condition(condition, ctx) {
            Ok(true) => {}
            Ok(false) => {
                deps.store
                    .update_step(run_id, &job.id, &step.id, |step| {
                        step.status = StepStatus::Skipped;
                        step.skip_reason = Some(condition.clone());
                    })
                    .await?;
                deps.events.publish(RunEvent::StepSkipped {
                    run_id,
                    step_id: step.id.clone(),
                    reason: condition.clone(),
                    timestamp: Utc::now(),
                });
                return Ok(StepFlow::Continue);
            }
            Err(e) => {
                let error = ErrorInfo::coded(codes::INVALID_IF_EXPRESSION, e.to_string());
                return fail_step(runner, run_id, job, step, error).await;
            }
        }
    }

    // Transition to running.
    let Some(current) = deps
        .store
        .update_step(run_id, &job.id, &step.id, |step| {
            step.status = StepStatus::Running;
            if step.started_at.is_none() {
                step.started_at = Some(Utc::now());
            }
            step.finished_at = None;
            step.duration_ms = None;
            step.error = None;
            step.outputs = None;
            step.skip_reason = None;
            step.attempt += 1;
        })
        .await?
    else {
        tracing::warn!(step_id = %step.id, "step vanished before start, skipping");
        return Ok(StepFlow::Continue);
    };
    deps.events.publish(RunEvent::StepStarted {
        run_id,
        step_id: current.id.clone(),
        attempt: current.attempt,
        timestamp: Utc::now(),
    });

    let mut spec = current.spec.clone();
    spec.with = expr::interpolate_params(&spec.with, ctx);

    let outcome = match spec.uses.clone() {
        UsesRef::Workflow(workflow_id) => {
            subflow::run_subflow(runner, run, job, &current, &workflow_id, &spec.with, signal).await
        }
        uses => {
            let Some(executor) = deps.executors.executor_for(&uses) else {
                let error = ErrorInfo::coded(
                    codes::UNSUPPORTED_STEP,
                    format!("no executor registered for {uses}"),
                );
                return fail_step(runner, run_id, job, &current, error).await;
            };

            let mut env = ctx.env.clone();
            env.extend(spec.env.clone());
            let secrets = deps.secrets.resolve(&spec.secrets).await;
            let artifacts = deps.artifacts.client_for(run_id, &job.name);

            // Step-level timeout composes onto the job signal.
            let step_token = signal.token().child_token();
            let timed_out = Arc::new(AtomicBool::new(false));
            let watchdog = current.timeout_ms.map(|timeout_ms| {
                let token = step_token.clone();
                let timed_out = Arc::clone(&timed_out);
                tokio::spawn(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                            timed_out.store(true, Ordering::SeqCst);
                            token.cancel();
                        }
                    }
                })
            });

            let request = StepRequest {
                spec: spec.clone(),
                workspace: artifacts.base_path(),
                signal: step_token,
                context: StepContext {
                    run_id,
                    job_id: job.id.clone(),
                    step_id: current.id.clone(),
                    attempt: current.attempt,
                    env,
                    secrets,
                    artifacts,
                },
            };
            let outcome = executor.execute(request).await;
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }

            // A timed-out step is a failure with its own code; the executor
            // outcome wins whenever it finished first.
            match outcome {
                StepOutcome::Cancelled { .. }
                    if timed_out.load(Ordering::SeqCst) && !signal.is_cancelled() =>
                {
                    StepOutcome::failed(ErrorInfo::coded(
                        codes::STEP_TIMEOUT,
                        format!(
                            "step exceeded its timeout of {}ms",
                            current.timeout_ms.unwrap_or_default()
                        ),
                    ))
                }
                outcome => outcome,
            }
        }
    };

    match outcome {
        StepOutcome::Success { outputs } => {
            deps.store
                .update_step(run_id, &job.id, &current.id, |step| {
                    step.status = StepStatus::Success;
                    step.outputs = Some(outputs.clone());
                    step.stamp_finished();
                })
                .await?;
            ctx.cache_step_outputs(current.user_id.as_deref(), &outputs);
            deps.events.publish(RunEvent::StepSuccess {
                run_id,
                step_id: current.id.clone(),
                timestamp: Utc::now(),
            });
            Ok(StepFlow::Continue)
        }
        StepOutcome::Failed { error } => fail_step(runner, run_id, job, &current, error).await,
        StepOutcome::Cancelled { .. } => {
            deps.store
                .update_step(run_id, &job.id, &current.id, |step| {
                    step.status = StepStatus::Cancelled;
                    step.stamp_finished();
                })
                .await?;
            deps.events.publish(RunEvent::StepCancelled {
                run_id,
                step_id: current.id.clone(),
                timestamp: Utc::now(),
            });
            Ok(StepFlow::Cancelled)
        }
    }
}

async fn fail_step(
    runner: &JobRunner,
    run_id: RunId,
    job: &JobRun,
    step: &StepRun,
    error: ErrorInfo,
) -> Result<StepFlow, StateStoreError> {
    let deps = runner.deps();
    deps.store
        .update_step(run_id, &job.id, &step.id, |step| {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            step.stamp_finished();
        })
        .await?;
    deps.events.publish(RunEvent::StepFailed {
        run_id,
        step_id: step.id.clone(),
        error: Some(error.clone()),
        timestamp: Utc::now(),
    });

    if step.continue_on_error {
        tracing::warn!(step_id = %step.id, error = %error, "step failed, continuing on error");
        return Ok(StepFlow::Continue);
    }
    Ok(StepFlow::Fail(error))
}

/// Unions the job's actually-produced declared paths into `run.artifacts`,
/// prefixed by job name.
pub(super) async fn capture_job_artifacts(
    runner: &JobRunner,
    run_id: RunId,
    job: &JobRun,
) -> Result<(), StateStoreError> {
    let Some(artifacts) = &job.artifacts else {
        return Ok(());
    };
    if artifacts.produce.is_empty() {
        return Ok(());
    }

    let client = runner.deps().artifacts.client_for(run_id, &job.name);
    let captured = capture_produced(client.as_ref(), &artifacts.produce).await;
    if captured.is_empty() {
        return Ok(());
    }

    runner
        .deps()
        .store
        .update_run(run_id, |run| {
            for path in &captured {
                let prefixed = format!("{}/{path}", job.name);
                if !run.artifacts.contains(&prefixed) {
                    run.artifacts.push(prefixed);
                }
            }
        })
        .await?;
    Ok(())
}
