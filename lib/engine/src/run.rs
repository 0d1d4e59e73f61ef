//! Run/job/step data model.
//!
//! A run is a materialised execution of a workflow spec: one [`JobRun`] per
//! declared job, one [`StepRun`] per declared step, all owned exclusively by
//! the run document. Status invariants:
//!
//! - a run is `queued` until any job starts, `running` once one does, and
//!   terminal exactly when every job is terminal
//! - a job reaches `running` only from `queued` or `running` (crash
//!   re-entry), and a terminal status only from `running`
//! - `pending_dependencies ⊆ needs`, and `blocked` exactly when pending
//!   dependencies remain

use crate::error::ErrorInfo;
use crate::spec::{
    ArtifactsSpec, ExecTarget, JobHooks, JobSpec, Priority, RetryPolicy, StepSpec, WorkflowSpec,
};
use camshaft_core::{JobRunId, RunId, StepRunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No job has started yet.
    Queued,
    /// At least one job has entered `running`.
    Running,
    /// Every job succeeded.
    Success,
    /// At least one job failed.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns true if a worker may (re-)dispatch a job in this state.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// What launched a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Push,
    Schedule,
    /// Launched by a parent run's `workflow:` step.
    Workflow,
}

/// Trigger descriptor attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    /// The trigger kind.
    pub kind: TriggerKind,
    /// Who or what pulled the trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Trigger payload made available to expressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl TriggerInfo {
    /// A manual trigger with an optional actor.
    #[must_use]
    pub fn manual(actor: Option<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            actor,
            payload: None,
        }
    }
}

/// Linkage from a child run back to the parent step that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentLink {
    /// The parent run.
    pub run_id: RunId,
    /// The parent job.
    pub job_id: JobRunId,
    /// The `workflow:` step in the parent.
    pub step_id: StepRunId,
}

/// Run metadata not derivable from the spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Caller-supplied deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Concurrency group held by this run while it is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,
    /// Registry id of the workflow, when resolved through one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Sub-workflow nesting depth (0 for top-level runs).
    #[serde(default)]
    pub workflow_depth: u32,
    /// Parent linkage for sub-workflow runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
}

/// Aggregated metrics of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub jobs_total: u32,
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
    pub jobs_cancelled: u32,
    pub steps_total: u32,
    pub steps_failed: u32,
    pub steps_cancelled: u32,
    /// Wall-clock duration of the run in milliseconds.
    pub time_ms: i64,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Terminal status.
    pub status: RunStatus,
    /// Aggregated metrics.
    pub metrics: RunMetrics,
    /// First discovered job- or step-level error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Short human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// A materialised run of a workflow spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run id.
    pub id: RunId,
    /// Workflow name from the spec.
    pub name: String,
    /// Spec version.
    pub version: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Trigger descriptor.
    pub trigger: TriggerInfo,
    /// Metadata (idempotency, concurrency, parent linkage).
    #[serde(default)]
    pub metadata: RunMetadata,
    /// Run-level environment (spec env plus submission overrides).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// When the run record was created.
    pub created_at: DateTime<Utc>,
    /// When the run was queued for dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    /// When the first job started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// The run's jobs, in spec declaration order.
    pub jobs: Vec<JobRun>,
    /// Produced artifact paths (`<jobName>/<path>`), unioned as jobs
    /// succeed.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Final result, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

impl Run {
    /// Materialises the initial run tree for a spec.
    ///
    /// Every job starts `queued` with `attempt = 0` and its pending
    /// dependency list equal to `needs`; every step starts `queued`.
    #[must_use]
    pub fn from_spec(
        id: RunId,
        spec: &WorkflowSpec,
        trigger: TriggerInfo,
        metadata: RunMetadata,
        env_overrides: &BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        let mut env = spec.env.clone();
        env.extend(env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let jobs = spec
            .jobs
            .iter()
            .map(|job_spec| JobRun::from_spec(id, job_spec))
            .collect();

        Self {
            id,
            name: spec.name.clone(),
            version: spec.version.clone(),
            status: RunStatus::Queued,
            trigger,
            metadata,
            env,
            created_at: now,
            queued_at: Some(now),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            jobs,
            artifacts: Vec::new(),
            result: None,
        }
    }

    /// Returns the job with the given id.
    #[must_use]
    pub fn job(&self, job_id: &JobRunId) -> Option<&JobRun> {
        self.jobs.iter().find(|j| &j.id == job_id)
    }

    /// Returns a mutable reference to the job with the given id.
    pub fn job_mut(&mut self, job_id: &JobRunId) -> Option<&mut JobRun> {
        self.jobs.iter_mut().find(|j| &j.id == job_id)
    }

    /// Returns true when every job is in a terminal state.
    #[must_use]
    pub fn all_jobs_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Aggregates job/step counters for the execution result.
    #[must_use]
    pub fn aggregate_metrics(&self) -> RunMetrics {
        let mut metrics = RunMetrics {
            jobs_total: self.jobs.len() as u32,
            ..RunMetrics::default()
        };
        for job in &self.jobs {
            match job.status {
                JobStatus::Success => metrics.jobs_succeeded += 1,
                JobStatus::Failed => metrics.jobs_failed += 1,
                JobStatus::Cancelled => metrics.jobs_cancelled += 1,
                _ => {}
            }
            metrics.steps_total += job.steps.len() as u32;
            for step in &job.steps {
                match step.status {
                    StepStatus::Failed => metrics.steps_failed += 1,
                    StepStatus::Cancelled => metrics.steps_cancelled += 1,
                    _ => {}
                }
            }
        }
        metrics.time_ms = match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => (finished - started).num_milliseconds().max(0),
            (Some(started), None) => (Utc::now() - started).num_milliseconds().max(0),
            _ => 0,
        };
        metrics
    }

    /// Returns the first discovered job- or step-level error, walking jobs
    /// and steps in order.
    #[must_use]
    pub fn first_error(&self) -> Option<ErrorInfo> {
        for job in &self.jobs {
            for step in &job.steps {
                if let Some(error) = &step.error {
                    return Some(error.clone());
                }
            }
            if let Some(error) = &job.error {
                return Some(error.clone());
            }
        }
        None
    }

    /// Builds the execution result for a terminal status.
    #[must_use]
    pub fn build_result(&self, status: RunStatus) -> ExecutionResult {
        let metrics = self.aggregate_metrics();
        let summary = format!(
            "{}/{} jobs succeeded",
            metrics.jobs_succeeded, metrics.jobs_total
        );
        ExecutionResult {
            status,
            metrics,
            error: self.first_error(),
            summary: Some(summary),
        }
    }

    /// Marks the run running, recording the start time once.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Moves the run to a terminal status and stamps duration.
    pub fn finish(&mut self, status: RunStatus, result: ExecutionResult) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some(
            self.started_at
                .map(|started| (now - started).num_milliseconds().max(0))
                .unwrap_or(0),
        );
        self.result = Some(result);
    }
}

/// One job within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    /// Identity: `<runId>:<jobName>`.
    pub id: JobRunId,
    /// The job's spec name.
    pub name: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Execution target.
    pub target: ExecTarget,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Timeout, already clamped to the 24h cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Optional concurrency sub-group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,
    /// Number of completed dispatch attempts.
    pub attempt: u32,
    /// Declared dependencies.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Dependencies not yet satisfied.
    #[serde(default)]
    pub pending_dependencies: Vec<String>,
    /// True while `pending_dependencies` is non-empty.
    pub blocked: bool,
    /// Job-level environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Artifact declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsSpec>,
    /// Lifecycle hooks.
    #[serde(default)]
    pub hooks: JobHooks,
    /// The job's steps, in index order.
    pub steps: Vec<StepRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl JobRun {
    /// Materialises the initial record for a job spec.
    #[must_use]
    pub fn from_spec(run_id: RunId, spec: &JobSpec) -> Self {
        let id = JobRunId::new(run_id, &spec.name);
        let steps = spec
            .steps
            .iter()
            .enumerate()
            .map(|(index, step_spec)| StepRun::from_spec(&id, index as u32, step_spec))
            .collect();

        Self {
            id,
            name: spec.name.clone(),
            status: JobStatus::Queued,
            target: spec.target,
            retry: spec.retry.clone(),
            timeout_ms: spec.effective_timeout_ms(),
            priority: spec.priority,
            concurrency_group: spec.concurrency_group.clone(),
            attempt: 0,
            needs: spec.needs.clone(),
            pending_dependencies: spec.needs.clone(),
            blocked: !spec.needs.is_empty(),
            env: spec.env.clone(),
            artifacts: spec.artifacts.clone(),
            hooks: spec.hooks.clone(),
            steps,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Returns the step with the given id.
    #[must_use]
    pub fn step(&self, step_id: &StepRunId) -> Option<&StepRun> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Returns a mutable reference to the step with the given id.
    pub fn step_mut(&mut self, step_id: &StepRunId) -> Option<&mut StepRun> {
        self.steps.iter_mut().find(|s| &s.id == step_id)
    }

    /// Removes a satisfied dependency; returns true if the job just became
    /// unblocked.
    pub fn satisfy_dependency(&mut self, completed_job: &str) -> bool {
        let before = self.pending_dependencies.len();
        self.pending_dependencies.retain(|name| name != completed_job);
        if self.pending_dependencies.len() == before {
            return false;
        }
        let was_blocked = self.blocked;
        self.blocked = !self.pending_dependencies.is_empty();
        was_blocked && !self.blocked
    }

    /// Resets the job to `queued` after an abort, clearing execution state.
    ///
    /// The attempt counter is left for the caller: an abort is not an
    /// attempt.
    pub fn reset_to_queued(&mut self) {
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.finished_at = None;
        self.duration_ms = None;
        self.error = None;
        for step in &mut self.steps {
            step.reset_to_queued();
        }
    }

    /// Moves the job to a terminal status and stamps duration.
    pub fn finish(&mut self, status: JobStatus, error: Option<ErrorInfo>) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some(
            self.started_at
                .map(|started| (now - started).num_milliseconds().max(0))
                .unwrap_or(0),
        );
        self.error = error;
    }
}

/// One step within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    /// Identity: `<jobId>:<index>`.
    pub id: StepRunId,
    /// The step's user-chosen id for expression references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Zero-based position within the job.
    pub index: u32,
    /// Lifecycle status.
    pub status: StepStatus,
    /// The embedded spec this step executes.
    pub spec: StepSpec,
    /// Execution attempts of this step across job attempts.
    pub attempt: u32,
    /// Step timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether a failure of this step lets the job continue.
    pub continue_on_error: bool,
    /// Why the step was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Outputs, defined exactly when the step succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, JsonValue>>,
    /// Error of the last failed execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl StepRun {
    /// Materialises the initial record for a step spec.
    #[must_use]
    pub fn from_spec(job_id: &JobRunId, index: u32, spec: &StepSpec) -> Self {
        Self {
            id: StepRunId::new(job_id.clone(), index),
            user_id: spec.id.clone(),
            index,
            status: StepStatus::Queued,
            attempt: 0,
            timeout_ms: spec.timeout_ms,
            continue_on_error: spec.continue_on_error,
            skip_reason: None,
            outputs: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            spec: spec.clone(),
        }
    }

    /// Resets the step to `queued`, clearing attempt and execution state.
    pub fn reset_to_queued(&mut self) {
        self.status = StepStatus::Queued;
        self.attempt = 0;
        self.skip_reason = None;
        self.outputs = None;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
        self.duration_ms = None;
    }

    /// Stamps `finished_at` and the clamped duration.
    pub fn stamp_finished(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = Some(
            self.started_at
                .map(|started| (now - started).num_milliseconds().max(0))
                .unwrap_or(0),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::UsesRef;

    fn two_job_spec() -> WorkflowSpec {
        serde_json::from_value(serde_json::json!({
            "name": "pipeline",
            "jobs": [
                {
                    "name": "build",
                    "steps": [
                        { "id": "compile", "uses": "builtin:shell", "with": { "run": "make" } },
                        { "uses": "builtin:shell", "with": { "run": "make test" } }
                    ]
                },
                {
                    "name": "deploy",
                    "needs": ["build"],
                    "steps": [{ "uses": "builtin:shell", "with": { "run": "make deploy" } }]
                }
            ]
        }))
        .expect("valid spec")
    }

    #[test]
    fn from_spec_builds_initial_tree() {
        let spec = two_job_spec();
        let run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(Some("alice".to_string())),
            RunMetadata::default(),
            &BTreeMap::new(),
        );

        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.jobs.len(), 2);

        let build = &run.jobs[0];
        assert_eq!(build.status, JobStatus::Queued);
        assert_eq!(build.attempt, 0);
        assert!(!build.blocked);
        assert_eq!(build.steps.len(), 2);
        assert_eq!(build.steps[0].user_id.as_deref(), Some("compile"));
        assert_eq!(build.steps[1].index, 1);
        assert_eq!(build.steps[0].spec.uses, UsesRef::Shell);

        let deploy = &run.jobs[1];
        assert!(deploy.blocked);
        assert_eq!(deploy.pending_dependencies, vec!["build".to_string()]);
    }

    #[test]
    fn satisfy_dependency_unblocks_once_empty() {
        let spec = two_job_spec();
        let mut run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(None),
            RunMetadata::default(),
            &BTreeMap::new(),
        );

        let deploy = &mut run.jobs[1];
        assert!(deploy.satisfy_dependency("build"));
        assert!(!deploy.blocked);
        assert!(deploy.pending_dependencies.is_empty());
        // Already satisfied; nothing changes.
        assert!(!deploy.satisfy_dependency("build"));
    }

    #[test]
    fn reset_to_queued_clears_execution_state() {
        let spec = two_job_spec();
        let mut run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(None),
            RunMetadata::default(),
            &BTreeMap::new(),
        );

        let job = &mut run.jobs[0];
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.attempt = 2;
        job.steps[0].status = StepStatus::Success;
        job.steps[0].attempt = 1;
        job.steps[0].outputs = Some(BTreeMap::new());

        job.reset_to_queued();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        // Abort is not an attempt; the counter survives the reset.
        assert_eq!(job.attempt, 2);
        assert_eq!(job.steps[0].status, StepStatus::Queued);
        assert_eq!(job.steps[0].attempt, 0);
        assert!(job.steps[0].outputs.is_none());
    }

    #[test]
    fn finish_stamps_duration() {
        let spec = two_job_spec();
        let mut run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(None),
            RunMetadata::default(),
            &BTreeMap::new(),
        );
        run.start();
        assert_eq!(run.status, RunStatus::Running);

        run.finish(
            RunStatus::Success,
            ExecutionResult {
                status: RunStatus::Success,
                metrics: RunMetrics::default(),
                error: None,
                summary: None,
            },
        );
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
        assert!(run.duration_ms.is_some_and(|d| d >= 0));
    }

    #[test]
    fn run_serde_roundtrip() {
        let spec = two_job_spec();
        let run = Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(Some("ci".to_string())),
            RunMetadata {
                idempotency_key: Some("key-1".to_string()),
                ..RunMetadata::default()
            },
            &BTreeMap::new(),
        );

        let json = serde_json::to_string(&run).expect("serialize");
        let parsed: Run = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(run, parsed);
    }

    #[test]
    fn status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(JobStatus::Queued.is_dispatchable());
        assert!(JobStatus::Running.is_dispatchable());
        assert!(!JobStatus::Success.is_dispatchable());
    }
}
