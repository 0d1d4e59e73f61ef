//! Versioned persistence of run documents.
//!
//! A run (with its jobs and steps) is stored as one JSON document wrapped in
//! the versioned envelope, indexed in a creation-time-sorted set for "list
//! recent runs". Mutation follows read-modify-write discipline: a mutator
//! closure receives an owned copy of the current record and the result is
//! written back whole. Concurrent writers compose last-writer-wins on the
//! run document; the job lease discipline keeps concurrent writers off the
//! same job.

use crate::error::StateStoreError;
use crate::run::{JobRun, JobStatus, Run, StepRun};
use camshaft_core::{JobRunId, RunId, StepRunId};
use camshaft_store::{Envelope, StoreBackend, keys};
use std::sync::Arc;

/// Store for run/job/step records.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StoreBackend>,
}

impl StateStore {
    /// Creates a state store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// Persists a run document and indexes it by creation time.
    pub async fn save_run(&self, run: &Run) -> Result<(), StateStoreError> {
        let key = keys::run(&run.id);
        let encoded = Envelope::new(run)
            .encode()
            .map_err(|e| StateStoreError::corrupt(&key, &e))?;
        self.backend.set(&key, &encoded, None).await?;
        self.backend
            .zadd(
                &keys::runs_index(),
                &run.id.to_string(),
                run.created_at.timestamp_millis() as f64,
            )
            .await?;
        Ok(())
    }

    /// Loads a run document.
    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StateStoreError> {
        let key = keys::run(&run_id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let run =
            Envelope::decode_current(&raw).map_err(|e| StateStoreError::corrupt(&key, &e))?;
        Ok(Some(run))
    }

    /// Deletes a run document and its index entry.
    pub async fn delete_run(&self, run_id: RunId) -> Result<bool, StateStoreError> {
        let existed = self.backend.delete(&keys::run(&run_id)).await?;
        self.backend
            .zrem(&keys::runs_index(), &run_id.to_string())
            .await?;
        Ok(existed)
    }

    /// Lists the most recently created runs, newest first.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Run>, StateStoreError> {
        let ids = self.backend.zrange_desc(&keys::runs_index(), limit).await?;
        let mut runs = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(run_id) = raw_id.parse::<RunId>() else {
                tracing::warn!(member = %raw_id, "dropping unparseable run index member");
                continue;
            };
            if let Some(run) = self.get_run(run_id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Applies a mutator to the run and persists the result.
    ///
    /// Returns the updated run, or `None` if the run does not exist.
    pub async fn update_run<F>(
        &self,
        run_id: RunId,
        mutate: F,
    ) -> Result<Option<Run>, StateStoreError>
    where
        F: FnOnce(&mut Run),
    {
        let Some(mut run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        mutate(&mut run);
        self.save_run(&run).await?;
        Ok(Some(run))
    }

    /// Applies a mutator to one job of a run and persists the whole run.
    ///
    /// Returns the updated job, or `None` if the run or job is missing.
    pub async fn update_job<F>(
        &self,
        run_id: RunId,
        job_id: &JobRunId,
        mutate: F,
    ) -> Result<Option<JobRun>, StateStoreError>
    where
        F: FnOnce(&mut JobRun),
    {
        let Some(mut run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let Some(job) = run.job_mut(job_id) else {
            return Ok(None);
        };
        mutate(job);
        let updated = job.clone();
        self.save_run(&run).await?;
        Ok(Some(updated))
    }

    /// Applies a mutator to one step and persists the whole run.
    ///
    /// Returns the updated step, or `None` if run, job or step is missing.
    pub async fn update_step<F>(
        &self,
        run_id: RunId,
        job_id: &JobRunId,
        step_id: &StepRunId,
        mutate: F,
    ) -> Result<Option<StepRun>, StateStoreError>
    where
        F: FnOnce(&mut StepRun),
    {
        let Some(mut run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let Some(step) = run.job_mut(job_id).and_then(|job| job.step_mut(step_id)) else {
            return Ok(None);
        };
        mutate(step);
        let updated = step.clone();
        self.save_run(&run).await?;
        Ok(Some(updated))
    }

    /// Removes `completed_job_name` from the pending dependencies of every
    /// queued job and returns the jobs that just became unblocked.
    pub async fn release_blocked_jobs(
        &self,
        run_id: RunId,
        completed_job_name: &str,
    ) -> Result<Vec<JobRun>, StateStoreError> {
        let mut released = Vec::new();
        let updated = self
            .update_run(run_id, |run| {
                for job in &mut run.jobs {
                    if job.status != JobStatus::Queued {
                        continue;
                    }
                    if job.satisfy_dependency(completed_job_name) {
                        released.push(job.clone());
                    }
                }
            })
            .await?;
        if updated.is_none() {
            return Ok(Vec::new());
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunMetadata, RunStatus, TriggerInfo};
    use crate::spec::WorkflowSpec;
    use camshaft_store::MemoryStore;
    use std::collections::BTreeMap;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryStore::new()))
    }

    fn make_run(jobs: serde_json::Value) -> Run {
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

    fn chain_run() -> Run {
        make_run(serde_json::json!([
            { "name": "a", "steps": [{ "uses": "builtin:shell" }] },
            { "name": "b", "needs": ["a"], "steps": [{ "uses": "builtin:shell" }] },
            { "name": "c", "needs": ["a", "b"], "steps": [{ "uses": "builtin:shell" }] }
        ]))
    }

    #[tokio::test]
    async fn save_get_roundtrip() {
        let store = store();
        let run = chain_run();
        store.save_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().expect("present");
        assert_eq!(loaded, run);
        assert_eq!(store.get_run(RunId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_document_and_index() {
        let store = store();
        let run = chain_run();
        store.save_run(&run).await.unwrap();

        assert!(store.delete_run(run.id).await.unwrap());
        assert!(!store.delete_run(run.id).await.unwrap());
        assert!(store.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_recent_returns_newest_first() {
        let store = store();
        let mut older = chain_run();
        older.created_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let newer = chain_run();
        store.save_run(&older).await.unwrap();
        store.save_run(&newer).await.unwrap();

        let runs = store.list_recent(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, newer.id);
        assert_eq!(runs[1].id, older.id);

        let limited = store.list_recent(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn update_run_persists_mutation() {
        let store = store();
        let run = chain_run();
        store.save_run(&run).await.unwrap();

        let updated = store
            .update_run(run.id, |run| run.status = RunStatus::Running)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(updated.status, RunStatus::Running);

        let reloaded = store.get_run(run.id).await.unwrap().expect("present");
        assert_eq!(reloaded.status, RunStatus::Running);

        let missing = store.update_run(RunId::new(), |_| {}).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_job_and_step_target_one_record() {
        let store = store();
        let run = chain_run();
        store.save_run(&run).await.unwrap();

        let job_id = run.jobs[0].id.clone();
        let updated = store
            .update_job(run.id, &job_id, |job| job.attempt = 3)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(updated.attempt, 3);

        let step_id = run.jobs[0].steps[0].id.clone();
        let updated = store
            .update_step(run.id, &job_id, &step_id, |step| step.attempt = 2)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(updated.attempt, 2);

        let reloaded = store.get_run(run.id).await.unwrap().expect("present");
        assert_eq!(reloaded.jobs[0].attempt, 3);
        assert_eq!(reloaded.jobs[0].steps[0].attempt, 2);
        // Untouched jobs stay untouched.
        assert_eq!(reloaded.jobs[1].attempt, 0);

        let ghost_job = JobRunId::new(run.id, "ghost");
        assert!(
            store
                .update_job(run.id, &ghost_job, |_| {})
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn release_blocked_jobs_unblocks_when_pending_empties() {
        let store = store();
        let run = chain_run();
        store.save_run(&run).await.unwrap();

        // Completing "a" unblocks "b" but not "c" (still waiting on "b").
        let released = store.release_blocked_jobs(run.id, "a").await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].name, "b");
        assert!(!released[0].blocked);

        let reloaded = store.get_run(run.id).await.unwrap().expect("present");
        let c = reloaded.job(&JobRunId::new(run.id, "c")).expect("job c");
        assert!(c.blocked);
        assert_eq!(c.pending_dependencies, vec!["b".to_string()]);

        // Completing "b" then unblocks "c".
        let released = store.release_blocked_jobs(run.id, "b").await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].name, "c");
    }

    #[tokio::test]
    async fn release_blocked_jobs_ignores_non_queued_jobs() {
        let store = store();
        let mut run = chain_run();
        run.jobs[1].status = JobStatus::Cancelled;
        store.save_run(&run).await.unwrap();

        let released = store.release_blocked_jobs(run.id, "a").await.unwrap();
        assert!(released.is_empty());
    }
}
