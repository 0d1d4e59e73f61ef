//! Worker daemon configuration.
//!
//! Strongly-typed configuration loaded from environment variables via the
//! `config` crate (nested sections use `__`, e.g. `WORKER__LEASE_TTL_MS`).

use camshaft_engine::coordinator::CoordinatorConfig;
use camshaft_engine::runner::RunnerConfig;
use camshaft_engine::scheduler::SchedulerConfig;
use camshaft_engine::{EngineConfig, WorkerOptions};
use serde::Deserialize;
use std::time::Duration;

/// Daemon configuration composed from engine and worker sections.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Worker loop settings.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Engine-wide settings.
    #[serde(default)]
    pub engine: EngineSection,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Worker loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Idle poll pause in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Job lease lifetime in milliseconds.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Lease renewal period in milliseconds (clamped to half the TTL).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Parallel job slots.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_ttl_ms() -> u64 {
    15_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_max_concurrent_jobs() -> usize {
    1
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Idempotency key lifetime in seconds.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Concurrency group lock lifetime in seconds.
    #[serde(default = "default_concurrency_ttl_secs")]
    pub concurrency_ttl_secs: u64,

    /// Scheduler future-entry window in milliseconds.
    #[serde(default = "default_look_ahead_ms")]
    pub look_ahead_ms: u64,

    /// Sub-workflow nesting cap.
    #[serde(default = "default_max_workflow_depth")]
    pub max_workflow_depth: u32,
}

fn default_idempotency_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_concurrency_ttl_secs() -> u64 {
    30 * 60
}

fn default_look_ahead_ms() -> u64 {
    1000
}

fn default_max_workflow_depth() -> u32 {
    2
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            concurrency_ttl_secs: default_concurrency_ttl_secs(),
            look_ahead_ms: default_look_ahead_ms(),
            max_workflow_depth: default_max_workflow_depth(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured value cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// The engine configuration this daemon config describes.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            coordinator: CoordinatorConfig {
                idempotency_ttl: Duration::from_secs(self.engine.idempotency_ttl_secs),
                concurrency_ttl: Duration::from_secs(self.engine.concurrency_ttl_secs),
            },
            scheduler: SchedulerConfig {
                look_ahead_ms: self.engine.look_ahead_ms,
            },
            lease_ttl: Duration::from_millis(self.worker.lease_ttl_ms),
            ..EngineConfig::default()
        }
    }

    /// The runner configuration this daemon config describes.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_workflow_depth: self.engine.max_workflow_depth,
            ..RunnerConfig::default()
        }
    }

    /// The worker options this daemon config describes.
    #[must_use]
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            lease_ttl: Duration::from_millis(self.worker.lease_ttl_ms),
            heartbeat_interval: Duration::from_millis(self.worker.heartbeat_interval_ms),
            max_concurrent_jobs: self.worker.max_concurrent_jobs,
            ..WorkerOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_section_has_spec_defaults() {
        let section = WorkerSection::default();
        assert_eq!(section.poll_interval_ms, 1000);
        assert_eq!(section.lease_ttl_ms, 15_000);
        assert_eq!(section.heartbeat_interval_ms, 5000);
        assert_eq!(section.max_concurrent_jobs, 1);
    }

    #[test]
    fn engine_section_has_spec_defaults() {
        let section = EngineSection::default();
        assert_eq!(section.idempotency_ttl_secs, 86_400);
        assert_eq!(section.concurrency_ttl_secs, 1800);
        assert_eq!(section.look_ahead_ms, 1000);
        assert_eq!(section.max_workflow_depth, 2);
    }
}
