//! Ready-job scheduling.
//!
//! Ready jobs live in three scored sets, one per priority level, scored by
//! `available_at` (epoch milliseconds). Dispatch walks the levels highest
//! first and claims the earliest-available entry by removing it from the
//! set; the removal's return value decides which of several competing
//! workers owns the entry, giving at-most-once dispatch.

use crate::error::StateStoreError;
use crate::run::{JobRun, JobStatus, Run};
use crate::spec::Priority;
use camshaft_core::{JobRunId, RunId};
use camshaft_store::{StoreBackend, keys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

/// How many entries to inspect per priority level when competing claims
/// knock earlier candidates away.
const DEQUEUE_BATCH: usize = 8;

/// A serialized pointer to a ready job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Unique entry id; preserved across reschedules.
    pub id: String,
    /// The run the job belongs to.
    pub run_id: RunId,
    /// The job to dispatch.
    pub job_id: JobRunId,
    /// The job's spec name.
    pub job_name: String,
    /// Dispatch priority (decides which queue holds the entry).
    pub priority: Priority,
    /// When the entry was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Epoch milliseconds at which the entry becomes dispatchable; also the
    /// entry's sort score.
    pub available_at: i64,
}

impl QueueEntry {
    fn for_job(job: &JobRun, available_at: i64) -> Self {
        Self {
            id: format!("qe_{}", Ulid::new()),
            run_id: job.id.run_id(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            priority: job.priority,
            enqueued_at: Utc::now(),
            available_at,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How far into the future a dequeue may reach (milliseconds).
    pub look_ahead_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { look_ahead_ms: 1000 }
    }
}

/// The ready-job scheduler.
#[derive(Clone)]
pub struct JobScheduler {
    backend: Arc<dyn StoreBackend>,
    config: SchedulerConfig,
}

impl JobScheduler {
    /// Creates a scheduler over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, config: SchedulerConfig) -> Self {
        Self { backend, config }
    }

    /// Enqueues every unblocked job of a freshly created run.
    ///
    /// Blocked jobs are held back; the runner releases them as their
    /// dependencies succeed.
    pub async fn schedule_run(&self, run: &Run) -> Result<usize, StateStoreError> {
        let mut enqueued = 0;
        for job in &run.jobs {
            if job.blocked || job.status != JobStatus::Queued {
                continue;
            }
            self.enqueue_job(job).await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Enqueues one job, available immediately.
    pub async fn enqueue_job(&self, job: &JobRun) -> Result<(), StateStoreError> {
        let entry = QueueEntry::for_job(job, Utc::now().timestamp_millis());
        self.push(&entry).await
    }

    /// Claims the next dispatchable entry, or `None` when all queues are
    /// empty within the look-ahead window.
    pub async fn dequeue_job(&self) -> Result<Option<QueueEntry>, StateStoreError> {
        let horizon = (Utc::now().timestamp_millis() + self.config.look_ahead_ms as i64) as f64;

        for priority in Priority::ALL {
            let key = keys::job_queue(&priority);
            let candidates = self
                .backend
                .zrange_by_score(&key, horizon, DEQUEUE_BATCH)
                .await?;
            for candidate in candidates {
                // Whoever removes the member owns the dispatch.
                if !self.backend.zrem(&key, &candidate.member).await? {
                    continue;
                }
                match serde_json::from_str::<QueueEntry>(&candidate.member) {
                    Ok(entry) => return Ok(Some(entry)),
                    Err(e) => {
                        tracing::warn!(error = %e, queue = %key, "dropping undecodable queue entry");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Re-inserts an entry with `available_at = now + delay`, preserving its
    /// identity and priority.
    pub async fn reschedule(
        &self,
        entry: &QueueEntry,
        delay_ms: u64,
    ) -> Result<(), StateStoreError> {
        let mut entry = entry.clone();
        entry.available_at = Utc::now().timestamp_millis() + delay_ms as i64;
        self.push(&entry).await
    }

    async fn push(&self, entry: &QueueEntry) -> Result<(), StateStoreError> {
        let member = serde_json::to_string(entry).map_err(|e| StateStoreError::Corrupt {
            key: keys::job_queue(&entry.priority),
            message: e.to_string(),
        })?;
        self.backend
            .zadd(
                &keys::job_queue(&entry.priority),
                &member,
                entry.available_at as f64,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunMetadata, TriggerInfo};
    use crate::spec::WorkflowSpec;
    use camshaft_store::MemoryStore;
    use std::collections::BTreeMap;

    fn scheduler() -> JobScheduler {
        JobScheduler::new(Arc::new(MemoryStore::new()), SchedulerConfig::default())
    }

    fn run_with_jobs(jobs: serde_json::Value) -> Run {
        let spec: WorkflowSpec =
            serde_json::from_value(serde_json::json!({ "name": "wf", "jobs": jobs }))
                .expect("valid spec");
        Run::from_spec(
            RunId::new(),
            &spec,
            TriggerInfo::manual(None),
            RunMetadata::default(),
            &BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn schedule_run_holds_back_blocked_jobs() {
        let scheduler = scheduler();
        let run = run_with_jobs(serde_json::json!([
            { "name": "a", "steps": [{ "uses": "builtin:shell" }] },
            { "name": "b", "needs": ["a"], "steps": [{ "uses": "builtin:shell" }] }
        ]));

        let enqueued = scheduler.schedule_run(&run).await.unwrap();
        assert_eq!(enqueued, 1);

        let entry = scheduler.dequeue_job().await.unwrap().expect("entry");
        assert_eq!(entry.job_name, "a");
        assert_eq!(entry.run_id, run.id);
        assert!(scheduler.dequeue_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_respects_priority_order() {
        let scheduler = scheduler();
        let run = run_with_jobs(serde_json::json!([
            { "name": "bulk", "priority": "low", "steps": [{ "uses": "builtin:shell" }] },
            { "name": "steady", "steps": [{ "uses": "builtin:shell" }] },
            { "name": "urgent", "priority": "high", "steps": [{ "uses": "builtin:shell" }] }
        ]));
        scheduler.schedule_run(&run).await.unwrap();

        let order: Vec<String> = [
            scheduler.dequeue_job().await.unwrap().unwrap().job_name,
            scheduler.dequeue_job().await.unwrap().unwrap().job_name,
            scheduler.dequeue_job().await.unwrap().unwrap().job_name,
        ]
        .into();
        assert_eq!(order, vec!["urgent", "steady", "bulk"]);
    }

    #[tokio::test]
    async fn reschedule_delays_availability_beyond_look_ahead() {
        let scheduler = scheduler();
        let run = run_with_jobs(serde_json::json!([
            { "name": "a", "steps": [{ "uses": "builtin:shell" }] }
        ]));
        scheduler.schedule_run(&run).await.unwrap();

        let entry = scheduler.dequeue_job().await.unwrap().expect("entry");
        scheduler.reschedule(&entry, 60_000).await.unwrap();

        // Not dispatchable inside the 1s look-ahead window.
        assert!(scheduler.dequeue_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reschedule_within_look_ahead_preserves_identity() {
        let scheduler = scheduler();
        let run = run_with_jobs(serde_json::json!([
            { "name": "a", "steps": [{ "uses": "builtin:shell" }] }
        ]));
        scheduler.schedule_run(&run).await.unwrap();

        let entry = scheduler.dequeue_job().await.unwrap().expect("entry");
        scheduler.reschedule(&entry, 10).await.unwrap();

        let again = scheduler.dequeue_job().await.unwrap().expect("entry");
        assert_eq!(again.id, entry.id);
        assert_eq!(again.job_id, entry.job_id);
        assert!(again.available_at >= entry.available_at);
    }

    #[tokio::test]
    async fn earlier_scores_dequeue_first_within_a_priority() {
        let scheduler = scheduler();
        let run = run_with_jobs(serde_json::json!([
            { "name": "first", "steps": [{ "uses": "builtin:shell" }] },
            { "name": "second", "steps": [{ "uses": "builtin:shell" }] }
        ]));

        // Push with explicit scores a minute apart.
        let mut early = QueueEntry::for_job(&run.jobs[0], Utc::now().timestamp_millis() - 60_000);
        early.id = "qe_early".to_string();
        let late = QueueEntry::for_job(&run.jobs[1], Utc::now().timestamp_millis());
        scheduler.push(&late).await.unwrap();
        scheduler.push(&early).await.unwrap();

        assert_eq!(
            scheduler.dequeue_job().await.unwrap().unwrap().job_name,
            "first"
        );
        assert_eq!(
            scheduler.dequeue_job().await.unwrap().unwrap().job_name,
            "second"
        );
    }
}
