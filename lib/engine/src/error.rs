//! Engine error types and the stable error-code vocabulary.
//!
//! Every job- and step-level failure is recorded as an [`ErrorInfo`] with a
//! human-readable message, an optional stable code from [`codes`], and
//! optional structured details. The run surfaces the first discovered error
//! through its execution result so a caller can point at a single root
//! cause.

use camshaft_core::RunId;
use camshaft_store::{EnvelopeError, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Stable error codes recorded on failed jobs and steps.
pub mod codes {
    /// Job aborted by worker shutdown or lease loss; reset to queued.
    pub const JOB_ABORTED: &str = "JOB_ABORTED";
    /// The job-level timeout fired.
    pub const JOB_TIMEOUT: &str = "JOB_TIMEOUT";
    /// The step-level timeout fired.
    pub const STEP_TIMEOUT: &str = "STEP_TIMEOUT";
    /// Generic step failure reported by an executor.
    pub const STEP_FAILED: &str = "STEP_FAILED";
    /// The executor ran the step and it exited unsuccessfully.
    pub const STEP_EXECUTION_FAILED: &str = "STEP_EXECUTION_FAILED";
    /// The executor itself crashed.
    pub const STEP_EXECUTION_CRASHED: &str = "STEP_EXECUTION_CRASHED";
    /// The step's embedded spec could not be found.
    pub const STEP_SPEC_NOT_FOUND: &str = "STEP_SPEC_NOT_FOUND";
    /// No executor is registered for the step's `uses` tag.
    pub const UNSUPPORTED_STEP: &str = "UNSUPPORTED_STEP";
    /// The step's parameters are invalid.
    pub const INVALID_STEP: &str = "INVALID_STEP";
    /// The step's `if` expression could not be parsed.
    pub const INVALID_IF_EXPRESSION: &str = "INVALID_IF_EXPRESSION";
    /// An approval request expired before a decision.
    pub const APPROVAL_TIMEOUT: &str = "APPROVAL_TIMEOUT";
    /// An approval request was rejected.
    pub const APPROVAL_REJECTED: &str = "APPROVAL_REJECTED";
    /// Sub-workflow step used without a configured registry.
    pub const WORKFLOW_REGISTRY_NOT_CONFIGURED: &str = "WORKFLOW_REGISTRY_NOT_CONFIGURED";
    /// The referenced workflow id did not resolve.
    pub const WORKFLOW_NOT_FOUND: &str = "WORKFLOW_NOT_FOUND";
    /// Sub-workflow nesting exceeded the configured depth.
    pub const WORKFLOW_DEPTH_EXCEEDED: &str = "WORKFLOW_DEPTH_EXCEEDED";
    /// The requested sub-workflow mode is not supported.
    pub const UNSUPPORTED_MODE: &str = "UNSUPPORTED_MODE";
    /// Creating the child run failed.
    pub const WORKFLOW_SPAWN_ERROR: &str = "WORKFLOW_SPAWN_ERROR";
    /// The child run finished with a failure.
    pub const CHILD_WORKFLOW_FAILED: &str = "CHILD_WORKFLOW_FAILED";
    /// The child run was cancelled.
    pub const CHILD_WORKFLOW_CANCELLED: &str = "CHILD_WORKFLOW_CANCELLED";
    /// The child run disappeared while being awaited.
    pub const CHILD_RUN_NOT_FOUND: &str = "CHILD_RUN_NOT_FOUND";
    /// The parent run was cancelled while awaiting the child.
    pub const PARENT_CANCELLED: &str = "PARENT_CANCELLED";
    /// An artifact merge could not be completed.
    pub const ARTIFACT_MERGE_FAILED: &str = "ARTIFACT_MERGE_FAILED";

    /// Codes whose failures are never retried regardless of policy.
    pub const NON_RETRYABLE: &[&str] = &[
        STEP_SPEC_NOT_FOUND,
        UNSUPPORTED_STEP,
        INVALID_STEP,
        INVALID_IF_EXPRESSION,
        APPROVAL_TIMEOUT,
        APPROVAL_REJECTED,
        WORKFLOW_REGISTRY_NOT_CONFIGURED,
        WORKFLOW_NOT_FOUND,
        WORKFLOW_DEPTH_EXCEEDED,
        UNSUPPORTED_MODE,
    ];
}

/// A structured error record carried on failed jobs and steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Human-readable description.
    pub message: String,
    /// Stable code from [`codes`], when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Structured details (exit codes, child run ids, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl ErrorInfo {
    /// Creates an error with a message only.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Creates an error with a message and a stable code.
    #[must_use]
    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.to_string()),
            details: None,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns true if retry policy may be applied to this error.
    ///
    /// Retry is forbidden for the validation-class codes and when the
    /// details carry `"retryable": false`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = &self.code
            && codes::NON_RETRYABLE.contains(&code.as_str())
        {
            return false;
        }
        if let Some(details) = &self.details
            && details.get("retryable") == Some(&JsonValue::Bool(false))
        {
            return false;
        }
        true
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors from the state store layer.
#[derive(Debug)]
pub enum StateStoreError {
    /// The backend failed.
    Backend(StoreError),
    /// A persisted document could not be decoded.
    Corrupt { key: String, message: String },
}

impl std::fmt::Display for StateStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "state store backend error: {e}"),
            Self::Corrupt { key, message } => {
                write!(f, "corrupt document at {key}: {message}")
            }
        }
    }
}

impl std::error::Error for StateStoreError {}

impl From<StoreError> for StateStoreError {
    fn from(e: StoreError) -> Self {
        Self::Backend(e)
    }
}

impl StateStoreError {
    /// Wraps an envelope decode failure for the given key.
    #[must_use]
    pub fn corrupt(key: impl Into<String>, e: &EnvelopeError) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: e.to_string(),
        }
    }
}

/// Errors from the run coordinator.
#[derive(Debug)]
pub enum CoordinatorError {
    /// The idempotency key was bound to another submission concurrently.
    IdempotencyConflict { key: String },
    /// The concurrency group is held by a live run.
    ConcurrencyBusy { group: String, holder: RunId },
    /// The job dependency graph is invalid.
    InvalidSpec(crate::graph::GraphError),
    /// The state store failed.
    Store(StateStoreError),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdempotencyConflict { key } => {
                write!(f, "idempotency key {key:?} was bound concurrently")
            }
            Self::ConcurrencyBusy { group, holder } => {
                write!(f, "concurrency group {group:?} is held by run {holder}")
            }
            Self::InvalidSpec(e) => write!(f, "invalid workflow spec: {e}"),
            Self::Store(e) => write!(f, "coordinator store error: {e}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<StateStoreError> for CoordinatorError {
    fn from(e: StateStoreError) -> Self {
        Self::Store(e)
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        Self::Store(StateStoreError::Backend(e))
    }
}

impl From<crate::graph::GraphError> for CoordinatorError {
    fn from(e: crate::graph::GraphError) -> Self {
        Self::InvalidSpec(e)
    }
}

/// Umbrella error for the in-process submission API.
#[derive(Debug)]
pub enum EngineError {
    /// Run admission failed.
    Coordinator(CoordinatorError),
    /// The state store failed.
    Store(StateStoreError),
    /// The shared backend failed.
    Backend(StoreError),
    /// An inline or on-disk spec could not be parsed.
    InvalidSpec { message: String },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Backend(e) => write!(f, "{e}"),
            Self::InvalidSpec { message } => write!(f, "invalid workflow spec: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<CoordinatorError> for EngineError {
    fn from(e: CoordinatorError) -> Self {
        Self::Coordinator(e)
    }
}

impl From<StateStoreError> for EngineError {
    fn from(e: StateStoreError) -> Self {
        Self::Store(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Backend(e)
    }
}
