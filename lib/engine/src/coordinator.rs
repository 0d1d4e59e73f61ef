//! Run admission.
//!
//! The coordinator turns a `(spec, trigger, idempotency key?, concurrency
//! group?)` request into a persisted initial run:
//!
//! 1. an existing idempotency binding short-circuits to the bound run
//! 2. the dependency graph is validated
//! 3. the concurrency group (if any) is taken with a compare-and-set bound
//!    to the new run id
//! 4. the run tree is materialised and persisted
//! 5. the idempotency key (if any) is registered with a compare-and-set
//!
//! A run releases its concurrency group when it reaches a terminal status;
//! idempotency bindings expire by TTL and are never released.

use crate::error::{CoordinatorError, StateStoreError};
use crate::graph;
use crate::run::{Run, RunMetadata, TriggerInfo};
use crate::spec::WorkflowSpec;
use crate::state::StateStore;
use camshaft_core::RunId;
use camshaft_store::{StoreBackend, keys};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lifetime of an idempotency key binding.
    pub idempotency_ttl: Duration,
    /// Lifetime of a concurrency group lock.
    pub concurrency_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            concurrency_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Input to run creation.
#[derive(Debug, Clone)]
pub struct CreateRunInput {
    /// The validated workflow spec.
    pub spec: WorkflowSpec,
    /// The trigger descriptor.
    pub trigger: TriggerInfo,
    /// Caller-supplied deduplication key.
    pub idempotency_key: Option<String>,
    /// Concurrency group; defaults to the spec's group when unset.
    pub concurrency_group: Option<String>,
    /// Environment overrides merged over the spec's env.
    pub env: BTreeMap<String, String>,
    /// Pre-filled metadata (workflow id, depth, parent linkage).
    pub metadata: RunMetadata,
}

impl CreateRunInput {
    /// A plain submission of a spec with a trigger.
    #[must_use]
    pub fn new(spec: WorkflowSpec, trigger: TriggerInfo) -> Self {
        Self {
            spec,
            trigger,
            idempotency_key: None,
            concurrency_group: None,
            env: BTreeMap::new(),
            metadata: RunMetadata::default(),
        }
    }
}

/// Result of run admission.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The created or looked-up run.
    pub run: Run,
    /// False when an idempotency binding returned an existing run.
    pub created: bool,
}

/// The run coordinator.
#[derive(Clone)]
pub struct RunCoordinator {
    store: StateStore,
    backend: Arc<dyn StoreBackend>,
    config: CoordinatorConfig,
}

impl RunCoordinator {
    /// Creates a coordinator over the given store.
    #[must_use]
    pub fn new(store: StateStore, config: CoordinatorConfig) -> Self {
        let backend = Arc::clone(store.backend());
        Self {
            store,
            backend,
            config,
        }
    }

    /// Creates the run for a submission, or returns the run already bound
    /// to its idempotency key.
    pub async fn ensure_run(&self, input: CreateRunInput) -> Result<Admission, CoordinatorError> {
        if let Some(key) = &input.idempotency_key
            && let Some(existing) = self.lookup_idempotent(key).await?
        {
            tracing::debug!(run_id = %existing.id, key = %key, "idempotent resubmission");
            return Ok(Admission {
                run: existing,
                created: false,
            });
        }

        graph::validate_dependencies(&input.spec)?;

        let run_id = RunId::new();
        let group = input
            .concurrency_group
            .clone()
            .or_else(|| input.spec.concurrency_group.clone());

        if let Some(group) = &group {
            self.acquire_concurrency(group, run_id).await?;
        }

        let metadata = RunMetadata {
            idempotency_key: input.idempotency_key.clone(),
            concurrency_group: group.clone(),
            ..input.metadata
        };
        let run = Run::from_spec(run_id, &input.spec, input.trigger, metadata, &input.env);
        self.store.save_run(&run).await?;

        if let Some(key) = &input.idempotency_key {
            let registered = self
                .backend
                .set_if_absent(
                    &keys::idempotency(key),
                    &run_id.to_string(),
                    Some(self.config.idempotency_ttl),
                )
                .await?;
            if !registered {
                // Someone else bound the key between the lookup and now;
                // withdraw this run entirely.
                if let Some(group) = &group {
                    let _ = self.release_group(group, run_id).await;
                }
                self.store.delete_run(run_id).await?;
                return Err(CoordinatorError::IdempotencyConflict { key: key.clone() });
            }
        }

        tracing::info!(run_id = %run_id, workflow = %run.name, "run created");
        Ok(Admission { run, created: true })
    }

    /// Releases the concurrency group of a terminal run.
    pub async fn release_concurrency(&self, run: &Run) -> Result<(), CoordinatorError> {
        if let Some(group) = &run.metadata.concurrency_group {
            self.release_group(group, run.id).await?;
        }
        Ok(())
    }

    async fn lookup_idempotent(&self, key: &str) -> Result<Option<Run>, CoordinatorError> {
        let Some(bound) = self.backend.get(&keys::idempotency(key)).await? else {
            return Ok(None);
        };
        let Ok(run_id) = bound.parse::<RunId>() else {
            tracing::warn!(key = %key, value = %bound, "dropping unparseable idempotency binding");
            return Ok(None);
        };
        Ok(self.store.get_run(run_id).await?)
    }

    async fn acquire_concurrency(
        &self,
        group: &str,
        run_id: RunId,
    ) -> Result<(), CoordinatorError> {
        let key = keys::concurrency(group);
        let acquired = self
            .backend
            .set_if_absent(&key, &run_id.to_string(), Some(self.config.concurrency_ttl))
            .await?;
        if acquired {
            return Ok(());
        }
        let holder = self
            .backend
            .get(&key)
            .await?
            .and_then(|raw| raw.parse::<RunId>().ok())
            // Holder expired between the two reads; surface something
            // rather than claiming in the same breath.
            .unwrap_or(run_id);
        Err(CoordinatorError::ConcurrencyBusy {
            group: group.to_string(),
            holder,
        })
    }

    async fn release_group(&self, group: &str, run_id: RunId) -> Result<(), StateStoreError> {
        self.backend
            .delete_if_equals(&keys::concurrency(group), &run_id.to_string())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;
    use camshaft_store::MemoryStore;

    fn coordinator() -> (RunCoordinator, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        let store = StateStore::new(backend.clone());
        (
            RunCoordinator::new(store, CoordinatorConfig::default()),
            backend,
        )
    }

    fn spec() -> WorkflowSpec {
        serde_json::from_value(serde_json::json!({
            "name": "deploy",
            "jobs": [{ "name": "ship", "steps": [{ "uses": "builtin:shell" }] }]
        }))
        .expect("valid spec")
    }

    fn input() -> CreateRunInput {
        CreateRunInput::new(spec(), TriggerInfo::manual(Some("alice".to_string())))
    }

    #[tokio::test]
    async fn creates_a_queued_run() {
        let (coordinator, _) = coordinator();
        let admission = coordinator.ensure_run(input()).await.unwrap();
        assert!(admission.created);
        let run = admission.run;

        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.jobs.len(), 1);
        assert_eq!(run.jobs[0].attempt, 0);
        assert!(run.queued_at.is_some());
    }

    #[tokio::test]
    async fn idempotent_resubmission_returns_the_same_run() {
        let (coordinator, _) = coordinator();
        let mut first_input = input();
        first_input.idempotency_key = Some("submit-1".to_string());

        let first = coordinator.ensure_run(first_input.clone()).await.unwrap();
        assert!(first.created);
        let second = coordinator.ensure_run(first_input).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.run.id, second.run.id);

        // A different key creates a different run.
        let mut other = input();
        other.idempotency_key = Some("submit-2".to_string());
        let third = coordinator.ensure_run(other).await.unwrap();
        assert_ne!(first.run.id, third.run.id);
    }

    #[tokio::test]
    async fn concurrency_group_admits_one_live_run() {
        let (coordinator, _) = coordinator();
        let mut first_input = input();
        first_input.concurrency_group = Some("prod".to_string());
        let first = coordinator.ensure_run(first_input.clone()).await.unwrap().run;

        let err = coordinator.ensure_run(first_input.clone()).await.unwrap_err();
        match err {
            CoordinatorError::ConcurrencyBusy { group, holder } => {
                assert_eq!(group, "prod");
                assert_eq!(holder, first.id);
            }
            other => panic!("expected ConcurrencyBusy, got {other}"),
        }

        // After release the group admits the next run.
        coordinator.release_concurrency(&first).await.unwrap();
        let second = coordinator.ensure_run(first_input).await.unwrap().run;
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn spec_level_group_applies_when_input_has_none() {
        let (coordinator, _) = coordinator();
        let mut spec = spec();
        spec.concurrency_group = Some("spec-group".to_string());
        let run = coordinator
            .ensure_run(CreateRunInput::new(spec.clone(), TriggerInfo::manual(None)))
            .await
            .unwrap()
            .run;
        assert_eq!(
            run.metadata.concurrency_group.as_deref(),
            Some("spec-group")
        );

        let err = coordinator
            .ensure_run(CreateRunInput::new(spec, TriggerInfo::manual(None)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ConcurrencyBusy { .. }));
    }

    #[tokio::test]
    async fn rejects_invalid_dependency_graphs() {
        let (coordinator, _) = coordinator();
        let bad_spec: WorkflowSpec = serde_json::from_value(serde_json::json!({
            "name": "wf",
            "jobs": [
                { "name": "a", "needs": ["b"], "steps": [{ "uses": "builtin:shell" }] },
                { "name": "b", "needs": ["a"], "steps": [{ "uses": "builtin:shell" }] }
            ]
        }))
        .expect("parses");

        let err = coordinator
            .ensure_run(CreateRunInput::new(bad_spec, TriggerInfo::manual(None)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn lost_idempotency_race_withdraws_the_run() {
        let (coordinator, backend) = coordinator();
        let mut racing_input = input();
        racing_input.idempotency_key = Some("contested".to_string());

        // Simulate the racer binding the key after our lookup would have
        // missed it: pre-bind it to an id that has no run document, so the
        // lookup falls through but registration conflicts.
        backend
            .set(&keys::idempotency(&"contested"), &RunId::new().to_string(), None)
            .await
            .unwrap();

        let err = coordinator.ensure_run(racing_input).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::IdempotencyConflict { .. }));
    }
}
