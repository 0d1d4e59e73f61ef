//! The worker dispatch loop.
//!
//! A worker pulls queue entries, takes an exclusive lease per job, and runs
//! each job in its own slot (bounded by `max_concurrent_jobs`). Every slot
//! arms a heartbeat that renews the lease; a renewal that finds the lease
//! gone signals the slot with `LeaseLost` and the runner resets the job for
//! another worker. `stop()` drains: the loop exits after the current
//! iteration, active slots are signalled `WorkerShutdown`, and shutdown
//! waits for all of them.

use crate::lease::{LeaseManager, LeaseState};
use crate::runner::{DispatchOutcome, JobRunner};
use crate::scheduler::QueueEntry;
use crate::signal::{AbortCause, CancelSignal};
use camshaft_core::WorkerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// This worker's identity.
    pub worker_id: WorkerId,
    /// Pause between polls when the queues are empty.
    pub poll_interval: Duration,
    /// Job lease lifetime.
    pub lease_ttl: Duration,
    /// Lease renewal period; forced into `[1s, lease_ttl / 2]`.
    pub heartbeat_interval: Duration,
    /// Parallel job slots.
    pub max_concurrent_jobs: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(),
            poll_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_millis(15_000),
            heartbeat_interval: Duration::from_millis(5000),
            max_concurrent_jobs: 1,
        }
    }
}

impl WorkerOptions {
    /// The heartbeat interval clamped into `[1s, lease_ttl / 2]`.
    ///
    /// A heartbeat slower than half the lease TTL would let the lease
    /// expire between renewals.
    #[must_use]
    pub fn effective_heartbeat_interval(&self) -> Duration {
        let ceiling = self.lease_ttl / 2;
        let floor = Duration::from_secs(1).min(ceiling);
        self.heartbeat_interval.clamp(floor, ceiling)
    }
}

/// Counter snapshot returned by [`Worker::metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerMetrics {
    /// Jobs handed to the runner.
    pub dispatched: u64,
    /// Jobs that reached a terminal status.
    pub completed: u64,
    /// Jobs requeued for retry.
    pub retried: u64,
    /// Jobs aborted and reset to queued.
    pub aborted: u64,
    /// Stale entries skipped.
    pub skipped: u64,
    /// Dispatches that errored at the runner layer.
    pub dispatch_errors: u64,
    /// Lease acquisitions lost to another worker.
    pub lease_conflicts: u64,
    /// Jobs currently in flight.
    pub in_flight: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    aborted: AtomicU64,
    skipped: AtomicU64,
    dispatch_errors: AtomicU64,
    lease_conflicts: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerMetrics {
        WorkerMetrics {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            lease_conflicts: self.lease_conflicts.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

struct WorkerInner {
    options: WorkerOptions,
    runner: JobRunner,
    leases: LeaseManager,
    stop: CancellationToken,
    slots: Arc<Semaphore>,
    counters: Counters,
}

/// A worker process's dispatch loop.
pub struct Worker {
    inner: Arc<WorkerInner>,
    main: Mutex<Option<JoinHandle<()>>>,
}

/// Creates a worker over a configured runner.
///
/// The lease manager is built from the worker's own lease TTL; everything
/// else (store, scheduler, events, executors) comes from the runner.
#[must_use]
pub fn create_workflow_worker(options: WorkerOptions, runner: JobRunner) -> Worker {
    let leases = LeaseManager::new(
        Arc::clone(runner.deps().store.backend()),
        options.lease_ttl,
    );
    Worker {
        inner: Arc::new(WorkerInner {
            options,
            runner,
            leases,
            stop: CancellationToken::new(),
            slots: Arc::new(Semaphore::new(1)),
            counters: Counters::default(),
        }),
        main: Mutex::new(None),
    }
}

impl Worker {
    /// Starts the dispatch loop. Idempotent.
    pub fn start(&self) {
        let mut main = self.main.lock().unwrap_or_else(PoisonError::into_inner);
        if main.is_some() {
            return;
        }
        // Size the slot pool now; Semaphore::new in the constructor cannot
        // see the options it belongs to.
        let extra = self.inner.options.max_concurrent_jobs.saturating_sub(1);
        self.inner.slots.add_permits(extra);
        let inner = Arc::clone(&self.inner);
        tracing::info!(
            worker_id = %inner.options.worker_id,
            slots = inner.options.max_concurrent_jobs,
            "worker starting"
        );
        *main = Some(tokio::spawn(run_loop(inner)));
    }

    /// Signals the loop to stop and waits for active slots to drain.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let handle = {
            let mut main = self.main.lock().unwrap_or_else(PoisonError::into_inner);
            main.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker loop join failed");
            }
        }
        tracing::info!(worker_id = %self.inner.options.worker_id, "worker stopped");
    }

    /// Stops the worker and flushes its event bridge.
    pub async fn dispose(&self) {
        self.stop().await;
        self.inner.runner.deps().events.shutdown().await;
    }

    /// Returns a snapshot of the worker's counters.
    #[must_use]
    pub fn metrics(&self) -> WorkerMetrics {
        self.inner.counters.snapshot()
    }

    /// The worker's identity.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.inner.options.worker_id
    }
}

async fn run_loop(inner: Arc<WorkerInner>) {
    let mut slots = JoinSet::new();

    loop {
        // Reap finished slots without blocking.
        while let Some(finished) = slots.try_join_next() {
            if let Err(e) = finished {
                tracing::error!(error = %e, "job slot panicked");
            }
        }
        if inner.stop.is_cancelled() {
            break;
        }

        // Wait for a free slot, bailing out on shutdown.
        let permit = tokio::select! {
            () = inner.stop.cancelled() => break,
            permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let entry = match inner.runner.deps().scheduler.dequeue_job().await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                drop(permit);
                idle_pause(&inner).await;
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dequeue failed");
                drop(permit);
                idle_pause(&inner).await;
                continue;
            }
        };

        // Exclusive lease; losers requeue the entry with a short delay.
        let owner = LeaseManager::owner_token(inner.options.worker_id);
        match inner.leases.acquire(&entry.job_id, &owner).await {
            Ok(true) => {}
            Ok(false) => {
                inner.counters.lease_conflicts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %entry.job_id, "lease busy, rescheduling entry");
                reschedule(&inner, &entry, inner.options.poll_interval).await;
                drop(permit);
                continue;
            }
            Err(e) => {
                tracing::warn!(job_id = %entry.job_id, error = %e, "lease acquisition failed");
                reschedule(&inner, &entry, inner.options.poll_interval).await;
                drop(permit);
                continue;
            }
        }

        inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        inner.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let slot_inner = Arc::clone(&inner);
        slots.spawn(run_slot(slot_inner, entry, owner, permit));
    }

    // Drain: slots observe WorkerShutdown through their signal.
    while let Some(finished) = slots.join_next().await {
        if let Err(e) = finished {
            tracing::error!(error = %e, "job slot panicked during drain");
        }
    }
}

async fn idle_pause(inner: &Arc<WorkerInner>) {
    tokio::select! {
        () = inner.stop.cancelled() => {}
        () = tokio::time::sleep(inner.options.poll_interval) => {}
    }
}

async fn reschedule(inner: &Arc<WorkerInner>, entry: &QueueEntry, delay: Duration) {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if let Err(e) = inner
        .runner
        .deps()
        .scheduler
        .reschedule(entry, delay_ms)
        .await
    {
        tracing::error!(entry = %entry.id, error = %e, "failed to reschedule entry");
    }
}

async fn run_slot(
    inner: Arc<WorkerInner>,
    entry: QueueEntry,
    owner: String,
    permit: OwnedSemaphorePermit,
) {
    let signal = CancelSignal::child_of(&inner.stop, AbortCause::WorkerShutdown);

    // Heartbeat: renew the lease, surrender the job when it is lost.
    let heartbeat = {
        let inner = Arc::clone(&inner);
        let signal = signal.clone();
        let job_id = entry.job_id.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.options.effective_heartbeat_interval());
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    () = signal.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match inner.leases.renew(&job_id, &owner).await {
                    Ok(LeaseState::Held) => {}
                    Ok(LeaseState::Lost) => {
                        tracing::warn!(job_id = %job_id, "lease lost, aborting job");
                        signal.trigger(AbortCause::LeaseLost);
                        break;
                    }
                    Err(e) => {
                        // Transient renewal failure; the TTL decides.
                        tracing::warn!(job_id = %job_id, error = %e, "lease renewal failed");
                    }
                }
            }
        })
    };

    let outcome = inner.runner.dispatch(&entry, &signal).await;

    signal.disarm();
    heartbeat.abort();

    match outcome {
        Ok(DispatchOutcome::Completed { released }) => {
            inner.counters.completed.fetch_add(1, Ordering::Relaxed);
            for job in released {
                tracing::debug!(job_id = %job.id, "dependency released, enqueueing");
                if let Err(e) = inner.runner.deps().scheduler.enqueue_job(&job).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to enqueue released job");
                }
            }
        }
        Ok(DispatchOutcome::Retry { delay_ms }) => {
            inner.counters.retried.fetch_add(1, Ordering::Relaxed);
            reschedule(&inner, &entry, Duration::from_millis(delay_ms)).await;
        }
        Ok(DispatchOutcome::Aborted) => {
            inner.counters.aborted.fetch_add(1, Ordering::Relaxed);
            reschedule(&inner, &entry, inner.options.poll_interval).await;
        }
        Ok(DispatchOutcome::Skipped) => {
            inner.counters.skipped.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            inner.counters.dispatch_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(entry = %entry.id, error = %e, "dispatch failed");
            reschedule(&inner, &entry, inner.options.poll_interval).await;
        }
    }

    if let Err(e) = inner.leases.release(&entry.job_id, &owner).await {
        tracing::warn!(job_id = %entry.job_id, error = %e, "lease release failed");
    }
    inner.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    drop(permit);
}
