//! Strongly-typed ID types for domain entities.
//!
//! Run and worker identifiers use ULID (Universally Unique Lexicographically
//! Sortable Identifier) format, providing both uniqueness and temporal
//! ordering. Job and step identifiers are composed from their parent run:
//! a job is addressed as `<runId>:<jobName>`, a step as `<jobId>:<index>`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                // Try with prefix first
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = if let Some(stripped) = s.strip_prefix(prefix_with_underscore) {
                    stripped
                } else {
                    // Try parsing as raw ULID
                    s
                };

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Unique identifier for a single execution (run) of a workflow.
    RunId,
    "run"
);

define_id!(
    /// Unique identifier for a worker process.
    WorkerId,
    "wkr"
);

/// Identifier for a job within a run, addressed as `<runId>:<jobName>`.
///
/// Job names come from the workflow spec and must not contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobRunId {
    run_id: RunId,
    job_name: String,
}

impl JobRunId {
    /// Creates a job ID from its run and the job's spec name.
    #[must_use]
    pub fn new(run_id: RunId, job_name: impl Into<String>) -> Self {
        Self {
            run_id,
            job_name: job_name.into(),
        }
    }

    /// Returns the run this job belongs to.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Returns the job's spec name.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_name
    }
}

impl fmt::Display for JobRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.run_id, self.job_name)
    }
}

impl FromStr for JobRunId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (run_part, job_name) = s.split_once(':').ok_or_else(|| ParseIdError {
            id_type: "JobRunId",
            reason: format!("missing ':' separator in {s:?}"),
        })?;
        if job_name.is_empty() {
            return Err(ParseIdError {
                id_type: "JobRunId",
                reason: "empty job name".to_string(),
            });
        }
        let run_id = run_part.parse::<RunId>().map_err(|e| ParseIdError {
            id_type: "JobRunId",
            reason: e.to_string(),
        })?;
        Ok(Self::new(run_id, job_name))
    }
}

impl Serialize for JobRunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobRunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Identifier for a step within a job, addressed as `<jobId>:<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepRunId {
    job_id: JobRunId,
    index: u32,
}

impl StepRunId {
    /// Creates a step ID from its job and the step's position.
    #[must_use]
    pub fn new(job_id: JobRunId, index: u32) -> Self {
        Self { job_id, index }
    }

    /// Returns the job this step belongs to.
    #[must_use]
    pub fn job_id(&self) -> &JobRunId {
        &self.job_id
    }

    /// Returns the step's zero-based position within the job.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for StepRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_id, self.index)
    }
}

impl FromStr for StepRunId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job_part, index_part) = s.rsplit_once(':').ok_or_else(|| ParseIdError {
            id_type: "StepRunId",
            reason: format!("missing ':' separator in {s:?}"),
        })?;
        let index = index_part.parse::<u32>().map_err(|e| ParseIdError {
            id_type: "StepRunId",
            reason: format!("bad step index {index_part:?}: {e}"),
        })?;
        let job_id = job_part.parse::<JobRunId>().map_err(|e| ParseIdError {
            id_type: "StepRunId",
            reason: e.to_string(),
        })?;
        Ok(Self::new(job_id, index))
    }
}

impl Serialize for StepRunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepRunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
