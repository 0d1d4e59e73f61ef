//! The step executor seam.
//!
//! The engine dispatches each step to an executor chosen by the step's
//! `uses` tag. Shell, approval and plugin executors live outside the engine
//! (they own process spawning, approval storage and sandboxing); the
//! `workflow:` tag is handled internally by the sub-workflow runner. This
//! module defines the contract plus configurable in-memory executors used
//! by tests and embedders.

use crate::artifacts::ArtifactClient;
use crate::error::{ErrorInfo, codes};
use crate::spec::{StepSpec, UsesRef};
use async_trait::async_trait;
use camshaft_core::{JobRunId, RunId, StepRunId};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identity and environment handed to an executor.
#[derive(Clone)]
pub struct StepContext {
    /// The run being executed.
    pub run_id: RunId,
    /// The job being executed.
    pub job_id: JobRunId,
    /// The step being executed.
    pub step_id: StepRunId,
    /// The step's execution attempt (1-based).
    pub attempt: u32,
    /// Merged run + job + step environment.
    pub env: BTreeMap<String, String>,
    /// Resolved secret values for the names the step declared.
    pub secrets: BTreeMap<String, String>,
    /// The job's artifact client.
    pub artifacts: Arc<dyn ArtifactClient>,
}

/// A single step dispatch.
#[derive(Clone)]
pub struct StepRequest {
    /// The step spec with `with` parameters already interpolated.
    pub spec: StepSpec,
    /// Root directory the step may treat as its workspace.
    pub workspace: String,
    /// Cooperative cancellation; fires on job abort, run cancel and step
    /// timeout.
    pub signal: CancellationToken,
    /// Identity and environment.
    pub context: StepContext,
}

/// Outcome of a step execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step succeeded, optionally with outputs.
    Success {
        outputs: BTreeMap<String, JsonValue>,
    },
    /// The step failed.
    Failed { error: ErrorInfo },
    /// The step observed cancellation and stopped.
    Cancelled { error: ErrorInfo },
}

impl StepOutcome {
    /// A success without outputs.
    #[must_use]
    pub fn success() -> Self {
        Self::Success {
            outputs: BTreeMap::new(),
        }
    }

    /// A success with the given outputs.
    #[must_use]
    pub fn with_outputs(outputs: BTreeMap<String, JsonValue>) -> Self {
        Self::Success { outputs }
    }

    /// A failure with the given error.
    #[must_use]
    pub fn failed(error: ErrorInfo) -> Self {
        Self::Failed { error }
    }

    /// A cancellation with a generic aborted error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::Cancelled {
            error: ErrorInfo::coded(codes::JOB_ABORTED, "step aborted"),
        }
    }
}

/// Trait for step execution.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Executes a step. Implementations observe `request.signal` and return
    /// `Cancelled` promptly when it fires.
    async fn execute(&self, request: StepRequest) -> StepOutcome;
}

/// Resolves secret names to values for step contexts.
///
/// Secret storage lives outside the engine; this seam only carries resolved
/// values into executors. Unresolvable names are omitted.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Resolves the given names. Missing names are absent from the result.
    async fn resolve(&self, names: &[String]) -> BTreeMap<String, String>;
}

/// A provider that resolves nothing.
pub struct NoSecrets;

#[async_trait]
impl SecretsProvider for NoSecrets {
    async fn resolve(&self, _names: &[String]) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// A provider over a fixed map, for tests and embedding.
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
}

impl StaticSecrets {
    /// Creates a provider over the given values.
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn resolve(&self, names: &[String]) -> BTreeMap<String, String> {
        names
            .iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }
}

/// Executor lookup by `uses` tag.
///
/// `workflow:` steps never reach this registry; the runner routes them to
/// the sub-workflow path first.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    shell: Option<Arc<dyn StepExecutor>>,
    approval: Option<Arc<dyn StepExecutor>>,
    plugin: Option<Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the `builtin:shell` executor.
    #[must_use]
    pub fn with_shell(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.shell = Some(executor);
        self
    }

    /// Registers the `builtin:approval` executor.
    #[must_use]
    pub fn with_approval(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.approval = Some(executor);
        self
    }

    /// Registers the `plugin:` executor.
    #[must_use]
    pub fn with_plugin(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.plugin = Some(executor);
        self
    }

    /// Looks up the executor for a `uses` reference.
    #[must_use]
    pub fn executor_for(&self, uses: &UsesRef) -> Option<Arc<dyn StepExecutor>> {
        match uses {
            UsesRef::Shell => self.shell.clone(),
            UsesRef::Approval => self.approval.clone(),
            UsesRef::Plugin(_) => self.plugin.clone(),
            UsesRef::Workflow(_) => None,
        }
    }
}

/// An executor that always returns a fixed outcome.
pub struct StaticExecutor {
    outcome: StepOutcome,
}

impl StaticExecutor {
    /// Succeeds with the given outputs.
    #[must_use]
    pub fn succeeding(outputs: BTreeMap<String, JsonValue>) -> Self {
        Self {
            outcome: StepOutcome::with_outputs(outputs),
        }
    }

    /// Fails with the given error.
    #[must_use]
    pub fn failing(error: ErrorInfo) -> Self {
        Self {
            outcome: StepOutcome::failed(error),
        }
    }
}

#[async_trait]
impl StepExecutor for StaticExecutor {
    async fn execute(&self, _request: StepRequest) -> StepOutcome {
        self.outcome.clone()
    }
}

/// An executor that fails the first `n` executions, then succeeds.
pub struct FailNTimesExecutor {
    remaining: AtomicU32,
    error: ErrorInfo,
    outputs: BTreeMap<String, JsonValue>,
}

impl FailNTimesExecutor {
    /// Fails `n` times with `error`, then succeeds with `outputs`.
    #[must_use]
    pub fn new(n: u32, error: ErrorInfo, outputs: BTreeMap<String, JsonValue>) -> Self {
        Self {
            remaining: AtomicU32::new(n),
            error,
            outputs,
        }
    }
}

#[async_trait]
impl StepExecutor for FailNTimesExecutor {
    async fn execute(&self, _request: StepRequest) -> StepOutcome {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return StepOutcome::failed(self.error.clone());
        }
        StepOutcome::with_outputs(self.outputs.clone())
    }
}

/// An executor that sleeps, honouring the cancellation signal.
pub struct SleepExecutor {
    duration: Duration,
}

impl SleepExecutor {
    /// Sleeps for `duration` before succeeding.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl StepExecutor for SleepExecutor {
    async fn execute(&self, request: StepRequest) -> StepOutcome {
        tokio::select! {
            () = tokio::time::sleep(self.duration) => StepOutcome::success(),
            () = request.signal.cancelled() => StepOutcome::cancelled(),
        }
    }
}

/// An executor that records every request it sees, then succeeds.
#[derive(Default)]
pub struct RecordingExecutor {
    seen: std::sync::Mutex<Vec<StepRequest>>,
}

impl RecordingExecutor {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the requests seen so far.
    #[must_use]
    pub fn requests(&self) -> Vec<StepRequest> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn execute(&self, request: StepRequest) -> StepOutcome {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request);
        StepOutcome::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::artifacts::ArtifactStore as _;

    fn request() -> StepRequest {
        let run_id = RunId::new();
        let job_id = JobRunId::new(run_id, "build");
        let artifacts = MemoryArtifactStore::new().client_for(run_id, "build");
        StepRequest {
            spec: serde_json::from_value(serde_json::json!({ "uses": "builtin:shell" }))
                .expect("valid step"),
            workspace: artifacts.base_path(),
            signal: CancellationToken::new(),
            context: StepContext {
                run_id,
                step_id: StepRunId::new(job_id.clone(), 0),
                job_id,
                attempt: 1,
                env: BTreeMap::new(),
                secrets: BTreeMap::new(),
                artifacts,
            },
        }
    }

    #[tokio::test]
    async fn registry_routes_by_tag() {
        let registry = ExecutorRegistry::new()
            .with_shell(Arc::new(StaticExecutor::succeeding(BTreeMap::new())));

        assert!(registry.executor_for(&UsesRef::Shell).is_some());
        assert!(registry.executor_for(&UsesRef::Approval).is_none());
        assert!(
            registry
                .executor_for(&UsesRef::Plugin("x".to_string()))
                .is_none()
        );
        assert!(
            registry
                .executor_for(&UsesRef::Workflow("x".to_string()))
                .is_none()
        );
    }

    #[tokio::test]
    async fn fail_n_times_recovers() {
        let executor = FailNTimesExecutor::new(
            2,
            ErrorInfo::coded(codes::STEP_EXECUTION_FAILED, "flaky"),
            BTreeMap::new(),
        );

        assert!(matches!(
            executor.execute(request()).await,
            StepOutcome::Failed { .. }
        ));
        assert!(matches!(
            executor.execute(request()).await,
            StepOutcome::Failed { .. }
        ));
        assert!(matches!(
            executor.execute(request()).await,
            StepOutcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn sleep_executor_honours_cancellation() {
        let executor = SleepExecutor::new(Duration::from_secs(60));
        let request = request();
        let signal = request.signal.clone();

        let handle = tokio::spawn(async move { executor.execute(request).await });
        signal.cancel();
        let outcome = handle.await.expect("join");
        assert!(matches!(outcome, StepOutcome::Cancelled { .. }));
    }
}
