//! Lifecycle hook execution.
//!
//! Hook order around the main steps: `pre` first, then the main sequence,
//! then `onSuccess` or `onFailure` depending on the main outcome, then
//! `post` unconditionally. The `post` phase is detached from the job
//! signal: it executes under its own token even when the job was cancelled,
//! so cleanup hooks still get their turn. Hook steps are transient: they
//! execute with the same context and executors as main steps but are never
//! persisted into the job, and a hook failure is logged without changing
//! the job's outcome. Hooks may not declare further hooks; a nested `hooks`
//! field is ignored with a warning.

use super::JobRunner;
use crate::error::codes;
use crate::executor::{StepContext, StepOutcome, StepRequest};
use crate::expr::{self, ExprContext};
use crate::run::{JobRun, Run, StepRun};
use crate::signal::CancelSignal;
use crate::spec::{StepSpec, UsesRef};
use tokio_util::sync::CancellationToken;

/// Index offset separating transient hook step ids from main step ids.
const HOOK_INDEX_BASE: u32 = 10_000;

pub(super) async fn run_hook_phase(
    runner: &JobRunner,
    run: &Run,
    job: &JobRun,
    phase: &str,
    hook_steps: &[StepSpec],
    ctx: &mut ExprContext,
    signal: &CancelSignal,
) {
    if hook_steps.is_empty() {
        return;
    }
    let detached = phase == "post";
    let phase_base = HOOK_INDEX_BASE + phase_offset(phase) * 1000;

    for (offset, spec) in hook_steps.iter().enumerate() {
        if !detached && signal.is_cancelled() {
            tracing::debug!(job_id = %job.id, phase, "hook phase interrupted by cancellation");
            return;
        }
        if spec.hooks.is_some() {
            tracing::warn!(job_id = %job.id, phase, "hook step declares nested hooks, ignoring them");
        }

        let step = StepRun::from_spec(&job.id, phase_base + offset as u32, spec);
        match run_hook_step(runner, run, job, &step, ctx, signal, detached).await {
            StepOutcome::Success { outputs } => {
                ctx.cache_step_outputs(step.user_id.as_deref(), &outputs);
            }
            StepOutcome::Failed { error } => {
                tracing::warn!(
                    job_id = %job.id,
                    phase,
                    hook = offset,
                    error = %error,
                    "hook step failed, continuing"
                );
            }
            StepOutcome::Cancelled { .. } => {
                tracing::debug!(job_id = %job.id, phase, hook = offset, "hook step cancelled");
                return;
            }
        }
    }
}

async fn run_hook_step(
    runner: &JobRunner,
    run: &Run,
    job: &JobRun,
    step: &StepRun,
    ctx: &ExprContext,
    signal: &CancelSignal,
    detached: bool,
) -> StepOutcome {
    let deps = runner.deps();

    if let Some(condition) = &step.spec.r#if {
        match expr::evaluate_condition(condition, ctx) {
            Ok(true) => {}
            Ok(false) => return StepOutcome::success(),
            Err(e) => {
                return StepOutcome::failed(crate::error::ErrorInfo::coded(
                    codes::INVALID_IF_EXPRESSION,
                    e.to_string(),
                ));
            }
        }
    }

    let mut spec = step.spec.clone();
    spec.with = expr::interpolate_params(&spec.with, ctx);

    // Sub-workflows are not available from hooks; treat like any other
    // unroutable step.
    let executor = match &spec.uses {
        UsesRef::Workflow(_) => None,
        uses => deps.executors.executor_for(uses),
    };
    let Some(executor) = executor else {
        return StepOutcome::failed(crate::error::ErrorInfo::coded(
            codes::UNSUPPORTED_STEP,
            format!("no executor registered for {}", spec.uses),
        ));
    };

    let mut env = ctx.env.clone();
    env.extend(spec.env.clone());
    let secrets = deps.secrets.resolve(&spec.secrets).await;
    let artifacts = deps.artifacts.client_for(run.id, &job.name);
    // A detached (post) hook must outlive a cancelled job signal.
    let token = if detached {
        CancellationToken::new()
    } else {
        signal.token().child_token()
    };

    executor
        .execute(StepRequest {
            workspace: artifacts.base_path(),
            signal: token,
            context: StepContext {
                run_id: run.id,
                job_id: job.id.clone(),
                step_id: step.id.clone(),
                attempt: 1,
                env,
                secrets,
                artifacts,
            },
            spec,
        })
        .await
}

fn phase_offset(phase: &str) -> u32 {
    match phase {
        "pre" => 0,
        "onSuccess" => 1,
        "onFailure" => 2,
        _ => 3,
    }
}
