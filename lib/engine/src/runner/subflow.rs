//! Sub-workflow invocation.
//!
//! A `workflow:<id>` step spawns a child run and awaits it: the id resolves
//! through the workflow registry, the nesting depth is enforced, the child
//! is created with trigger kind `workflow` and parent linkage (idempotency
//! and the parent's concurrency group are never propagated), and the parent
//! polls the child's status. Parent cancellation always propagates to the
//! child.

use super::JobRunner;
use crate::control;
use crate::coordinator::CreateRunInput;
use crate::error::{ErrorInfo, codes};
use crate::events::RunEvent;
use crate::executor::StepOutcome;
use crate::expr::{Value, coerce_to_string};
use crate::run::{JobRun, ParentLink, Run, RunMetadata, RunStatus, StepRun, TriggerInfo, TriggerKind};
use crate::signal::CancelSignal;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub(super) async fn run_subflow(
    runner: &JobRunner,
    parent: &Run,
    job: &JobRun,
    step: &StepRun,
    workflow_id: &str,
    with: &BTreeMap<String, JsonValue>,
    signal: &CancelSignal,
) -> StepOutcome {
    let deps = runner.deps();
    let fail = |code: &str, message: String| StepOutcome::failed(ErrorInfo::coded(code, message));

    // Mode: only synchronous waiting is supported in this revision.
    match with.get("mode").and_then(JsonValue::as_str) {
        None | Some("wait") => {}
        Some("fire-and-forget") => {
            return fail(
                codes::UNSUPPORTED_MODE,
                "mode \"fire-and-forget\" is not supported".to_string(),
            );
        }
        Some(other) => {
            return fail(
                codes::INVALID_STEP,
                format!("unknown sub-workflow mode {other:?}"),
            );
        }
    }

    let Some(registry) = &deps.registry else {
        return fail(
            codes::WORKFLOW_REGISTRY_NOT_CONFIGURED,
            "no workflow registry configured".to_string(),
        );
    };

    let depth = parent.metadata.workflow_depth + 1;
    if depth > runner.config().max_workflow_depth {
        return fail(
            codes::WORKFLOW_DEPTH_EXCEEDED,
            format!(
                "sub-workflow depth {depth} exceeds the maximum of {}",
                runner.config().max_workflow_depth
            ),
        );
    }

    let resolved = match registry.resolve(workflow_id).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            return fail(
                codes::WORKFLOW_NOT_FOUND,
                format!("workflow {workflow_id:?} did not resolve"),
            );
        }
        Err(e) => return fail(codes::INVALID_STEP, e.to_string()),
    };

    // Child environment: the parent's run env when inherited, plus inputs
    // coerced to strings.
    let inherit_env = with
        .get("inheritEnv")
        .and_then(JsonValue::as_bool)
        .unwrap_or(true);
    let mut env: BTreeMap<String, String> = if inherit_env {
        parent.env.clone()
    } else {
        BTreeMap::new()
    };
    if let Some(inputs) = with.get("inputs") {
        let Some(inputs) = inputs.as_object() else {
            return fail(
                codes::INVALID_STEP,
                "sub-workflow inputs must be an object".to_string(),
            );
        };
        for (key, value) in inputs {
            let coerced = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Null => String::new(),
                JsonValue::Bool(b) => coerce_to_string(&Value::Bool(*b)),
                JsonValue::Number(n) => coerce_to_string(&Value::Num(n.as_f64().unwrap_or(0.0))),
                other => other.to_string(),
            };
            env.insert(key.clone(), coerced);
        }
    }

    let input = CreateRunInput {
        spec: resolved.spec,
        trigger: TriggerInfo {
            kind: TriggerKind::Workflow,
            actor: Some(parent.id.to_string()),
            payload: None,
        },
        idempotency_key: None,
        concurrency_group: None,
        env,
        metadata: RunMetadata {
            workflow_id: Some(resolved.id.clone()),
            workflow_depth: depth,
            parent: Some(ParentLink {
                run_id: parent.id,
                job_id: job.id.clone(),
                step_id: step.id.clone(),
            }),
            ..RunMetadata::default()
        },
    };

    let child = match deps.coordinator.ensure_run(input).await {
        Ok(admission) => admission.run,
        Err(e) => return fail(codes::WORKFLOW_SPAWN_ERROR, e.to_string()),
    };
    deps.events.publish(RunEvent::RunQueued {
        run_id: child.id,
        timestamp: Utc::now(),
    });
    if let Err(e) = deps.scheduler.schedule_run(&child).await {
        return fail(codes::WORKFLOW_SPAWN_ERROR, e.to_string());
    }
    tracing::info!(parent = %parent.id, child = %child.id, workflow = %resolved.id, "sub-workflow spawned");

    // Await the child, propagating parent cancellation.
    loop {
        tokio::select! {
            () = signal.cancelled() => {
                let cancelled = control::cancel_run(
                    &deps.store,
                    &deps.events,
                    &deps.leases,
                    child.id,
                    Some(format!("parent run {} cancelled", parent.id)),
                )
                .await;
                if let Err(e) = cancelled {
                    tracing::warn!(child = %child.id, error = %e, "failed to cancel child run");
                }
                return StepOutcome::Cancelled {
                    error: ErrorInfo::coded(
                        codes::PARENT_CANCELLED,
                        "parent was cancelled while awaiting the sub-workflow",
                    ),
                };
            }
            () = tokio::time::sleep(runner.config().subflow_poll_interval) => {}
        }

        let current = match deps.store.get_run(child.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                return fail(
                    codes::CHILD_RUN_NOT_FOUND,
                    format!("child run {} disappeared", child.id),
                );
            }
            Err(e) => {
                tracing::warn!(child = %child.id, error = %e, "child poll failed");
                continue;
            }
        };
        if !current.status.is_terminal() {
            continue;
        }

        let child_result = serde_json::json!({
            "runId": current.id,
            "status": current.status,
            "metrics": current.result.as_ref().map(|r| r.metrics),
            "artifacts": current.artifacts,
        });
        return match current.status {
            RunStatus::Success => StepOutcome::with_outputs(
                [("childResult".to_string(), child_result)].into_iter().collect(),
            ),
            RunStatus::Cancelled => fail(
                codes::CHILD_WORKFLOW_CANCELLED,
                format!("child run {} was cancelled", current.id),
            ),
            _ => {
                let child_error = current
                    .result
                    .as_ref()
                    .and_then(|result| result.error.clone());
                StepOutcome::failed(
                    ErrorInfo::coded(
                        codes::CHILD_WORKFLOW_FAILED,
                        format!("child run {} failed", current.id),
                    )
                    .with_details(serde_json::json!({
                        "childResult": child_result,
                        "childError": child_error,
                    })),
                )
            }
        };
    }
}
