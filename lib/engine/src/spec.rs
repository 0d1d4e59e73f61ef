//! Workflow spec model.
//!
//! A workflow spec declares jobs, their dependencies (`needs`), their steps,
//! retry policy, timeouts, optional concurrency group, and triggers. Loading
//! and schema validation of author-facing YAML/JSON files happen outside the
//! engine; this module is the already-validated shape the engine executes.
//!
//! A step's `uses` reference is parsed once at load time into the
//! [`UsesRef`] tagged variant; executors are looked up by tag at dispatch.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upper bound on a job timeout (24 hours).
pub const MAX_JOB_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// A complete workflow spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Workflow name.
    pub name: String,
    /// Semantic version of the spec.
    #[serde(default = "default_version")]
    pub version: String,
    /// Environment applied to every job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional concurrency group serialising runs of this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,
    /// Trigger kinds this workflow may be launched by. Informational to the
    /// engine; trigger wiring (webhooks, cron) lives outside it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
    /// The jobs of this workflow, in declaration order.
    pub jobs: Vec<JobSpec>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl WorkflowSpec {
    /// Returns the job with the given name, if declared.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// A job declaration within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Job name, unique within the workflow.
    pub name: String,
    /// Names of jobs that must succeed before this one may start.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Where the job executes.
    #[serde(default)]
    pub target: ExecTarget,
    /// Retry policy applied on job failure.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Job timeout in milliseconds, capped at [`MAX_JOB_TIMEOUT_MS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Dispatch priority.
    #[serde(default)]
    pub priority: Priority,
    /// Optional concurrency sub-group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,
    /// Environment applied to every step of this job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Artifact declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsSpec>,
    /// Lifecycle hook step sequences.
    #[serde(default)]
    pub hooks: JobHooks,
    /// The main step sequence, executed in order.
    pub steps: Vec<StepSpec>,
}

impl JobSpec {
    /// Returns the job timeout clamped to the 24h upper bound.
    #[must_use]
    pub fn effective_timeout_ms(&self) -> Option<u64> {
        self.timeout_ms.map(|t| t.min(MAX_JOB_TIMEOUT_MS))
    }
}

/// A single step declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Optional user-chosen id, referenced from `if` expressions as
    /// `steps.<id>.outputs.<key>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The executor reference.
    pub uses: UsesRef,
    /// Executor parameters; string values are interpolated before dispatch.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, serde_json::Value>,
    /// Step-level environment overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Names of secrets the step needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Conditional expression; the step is skipped when it evaluates false.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub r#if: Option<String>,
    /// Step timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether a failure of this step lets the job continue.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Hooks are job-level; a hook step carrying its own nested hooks is
    /// ignored with a warning. Kept here so the field survives loading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<serde_json::Value>,
}

/// The executor a step is bound to, parsed from its `uses` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UsesRef {
    /// `builtin:shell`: the external shell executor.
    Shell,
    /// `builtin:approval`: the external approval executor.
    Approval,
    /// `plugin:<ref>`: a sandboxed plugin command.
    Plugin(String),
    /// `workflow:<id>`: a sub-workflow invocation.
    Workflow(String),
}

impl UsesRef {
    /// Returns the executor family tag (`shell`, `approval`, `plugin`,
    /// `workflow`).
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Approval => "approval",
            Self::Plugin(_) => "plugin",
            Self::Workflow(_) => "workflow",
        }
    }
}

impl fmt::Display for UsesRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell => write!(f, "builtin:shell"),
            Self::Approval => write!(f, "builtin:approval"),
            Self::Plugin(reference) => write!(f, "plugin:{reference}"),
            Self::Workflow(id) => write!(f, "workflow:{id}"),
        }
    }
}

impl FromStr for UsesRef {
    type Err = ParseUsesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builtin:shell" => return Ok(Self::Shell),
            "builtin:approval" => return Ok(Self::Approval),
            _ => {}
        }
        if let Some(reference) = s.strip_prefix("plugin:") {
            if reference.is_empty() {
                return Err(ParseUsesError {
                    uses: s.to_string(),
                    reason: "empty plugin reference".to_string(),
                });
            }
            return Ok(Self::Plugin(reference.to_string()));
        }
        if let Some(id) = s.strip_prefix("workflow:") {
            if id.is_empty() {
                return Err(ParseUsesError {
                    uses: s.to_string(),
                    reason: "empty workflow id".to_string(),
                });
            }
            return Ok(Self::Workflow(id.to_string()));
        }
        Err(ParseUsesError {
            uses: s.to_string(),
            reason: "expected builtin:shell, builtin:approval, plugin:<ref> or workflow:<id>"
                .to_string(),
        })
    }
}

/// Error from parsing a `uses` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseUsesError {
    /// The offending `uses` string.
    pub uses: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for ParseUsesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid uses reference {:?}: {}", self.uses, self.reason)
    }
}

impl std::error::Error for ParseUsesError {}

impl Serialize for UsesRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UsesRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Retry policy for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default)]
    pub max: u32,
    /// Backoff curve.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// First retry delay in milliseconds.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    /// Optional cap on the retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
}

fn default_initial_interval_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 0,
            backoff: BackoffKind::Exp,
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: None,
        }
    }
}

/// Backoff curve kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Exponential: `initial * 2^n`.
    #[default]
    Exp,
    /// Linear: `initial * (n + 1)`.
    Lin,
}

/// Dispatch priority of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dequeue order (highest first).
    pub const ALL: [Self; 3] = [Self::High, Self::Normal, Self::Low];

    /// The queue-key suffix for this priority.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a job executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecTarget {
    /// On the worker host.
    #[default]
    Local,
    /// Inside the sandbox runtime.
    Sandbox,
}

/// Artifact declarations of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsSpec {
    /// Paths the job produces, relative to its artifact root.
    #[serde(default)]
    pub produce: Vec<String>,
    /// Paths the job consumes from other jobs (`<jobName>/<path>`).
    #[serde(default)]
    pub consume: Vec<String>,
    /// Optional merge of artifacts from other jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSpec>,
}

/// Declarative artifact merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSpec {
    /// How sources are combined.
    pub strategy: MergeStrategy,
    /// Source paths in `<jobName>/<path>` form, combined in order.
    pub sources: Vec<String>,
    /// Output file name; defaults to the basename of the first source. The
    /// merged file is written under `merged/` in the merging job's root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Artifact merge strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Concatenate source bytes in order.
    Append,
    /// Keep only the last source.
    Overwrite,
    /// Parse each source as a JSON object and merge keys, later sources
    /// overriding earlier ones.
    JsonMerge,
}

/// Lifecycle hook step sequences of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHooks {
    /// Runs before the main steps.
    #[serde(default)]
    pub pre: Vec<StepSpec>,
    /// Runs after everything else, regardless of outcome.
    #[serde(default)]
    pub post: Vec<StepSpec>,
    /// Runs when the main steps succeed.
    #[serde(default)]
    pub on_success: Vec<StepSpec>,
    /// Runs when the main steps fail.
    #[serde(default)]
    pub on_failure: Vec<StepSpec>,
}

impl JobHooks {
    /// Returns true if no hook phase declares any steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty()
            && self.post.is_empty()
            && self.on_success.is_empty()
            && self.on_failure.is_empty()
    }
}
