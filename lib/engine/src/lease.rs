//! Job leases.
//!
//! A worker owns a job for the lease TTL: the lease key is taken with a
//! compare-and-set bound to a unique owner token, renewed by heartbeat, and
//! released with an owner-checked delete. A worker that cannot renew (the
//! value changed under it, or the key expired and was re-taken) has lost
//! the job and must surrender it.

use camshaft_core::{JobRunId, WorkerId};
use camshaft_store::{StoreBackend, StoreError, keys};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Outcome of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Still the owner; TTL extended.
    Held,
    /// The lease is gone or owned by someone else.
    Lost,
}

/// Manages job lease keys for one worker.
#[derive(Clone)]
pub struct LeaseManager {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl LeaseManager {
    /// Creates a lease manager with the given TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Returns the lease TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mints a fresh owner token for one acquisition.
    #[must_use]
    pub fn owner_token(worker_id: WorkerId) -> String {
        format!("{worker_id}:{}", Ulid::new())
    }

    /// Attempts to acquire the lease for a job.
    ///
    /// Returns `true` if this worker now holds the lease.
    pub async fn acquire(&self, job_id: &JobRunId, owner: &str) -> Result<bool, StoreError> {
        self.backend
            .set_if_absent(&keys::job_lease(job_id), owner, Some(self.ttl))
            .await
    }

    /// Renews the lease if still owned.
    pub async fn renew(&self, job_id: &JobRunId, owner: &str) -> Result<LeaseState, StoreError> {
        let key = keys::job_lease(job_id);
        match self.backend.get(&key).await? {
            Some(current) if current == owner => {
                if self.backend.extend_ttl(&key, self.ttl).await? {
                    Ok(LeaseState::Held)
                } else {
                    // Expired between the read and the extension.
                    Ok(LeaseState::Lost)
                }
            }
            _ => Ok(LeaseState::Lost),
        }
    }

    /// Releases the lease if still owned. Returns `true` on release.
    pub async fn release(&self, job_id: &JobRunId, owner: &str) -> Result<bool, StoreError> {
        self.backend
            .delete_if_equals(&keys::job_lease(job_id), owner)
            .await
    }

    /// Force-deletes the lease regardless of owner.
    ///
    /// Used by run cancellation: the owning worker observes the loss on its
    /// next heartbeat and aborts the job.
    pub async fn revoke(&self, job_id: &JobRunId) -> Result<bool, StoreError> {
        self.backend.delete(&keys::job_lease(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camshaft_core::RunId;
    use camshaft_store::MemoryStore;

    fn manager(ttl: Duration) -> LeaseManager {
        LeaseManager::new(Arc::new(MemoryStore::new()), ttl)
    }

    fn job_id() -> JobRunId {
        JobRunId::new(RunId::new(), "build")
    }

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let leases = manager(Duration::from_secs(15));
        let job = job_id();
        let owner_a = LeaseManager::owner_token(WorkerId::new());
        let owner_b = LeaseManager::owner_token(WorkerId::new());

        assert!(leases.acquire(&job, &owner_a).await.unwrap());
        assert!(!leases.acquire(&job, &owner_b).await.unwrap());

        assert!(leases.release(&job, &owner_a).await.unwrap());
        assert!(leases.acquire(&job, &owner_b).await.unwrap());
    }

    #[tokio::test]
    async fn renew_reports_loss_after_revocation() {
        let leases = manager(Duration::from_secs(15));
        let job = job_id();
        let owner = LeaseManager::owner_token(WorkerId::new());

        assert!(leases.acquire(&job, &owner).await.unwrap());
        assert_eq!(leases.renew(&job, &owner).await.unwrap(), LeaseState::Held);

        leases.revoke(&job).await.unwrap();
        assert_eq!(leases.renew(&job, &owner).await.unwrap(), LeaseState::Lost);
    }

    #[tokio::test]
    async fn release_refuses_foreign_owner() {
        let leases = manager(Duration::from_secs(15));
        let job = job_id();
        let owner = LeaseManager::owner_token(WorkerId::new());
        let intruder = LeaseManager::owner_token(WorkerId::new());

        assert!(leases.acquire(&job, &owner).await.unwrap());
        assert!(!leases.release(&job, &intruder).await.unwrap());
        assert!(leases.release(&job, &owner).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_retaken() {
        let leases = manager(Duration::from_millis(20));
        let job = job_id();
        let owner_a = LeaseManager::owner_token(WorkerId::new());
        let owner_b = LeaseManager::owner_token(WorkerId::new());

        assert!(leases.acquire(&job, &owner_a).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(leases.acquire(&job, &owner_b).await.unwrap());
        assert_eq!(leases.renew(&job, &owner_a).await.unwrap(), LeaseState::Lost);
    }
}
