//! Per-run event streams.
//!
//! The engine appends lifecycle events to a durable per-run stream through a
//! single in-process buffer: publishing never blocks and never fails the
//! run. A timer-driven flusher drains the buffer in batches into the shared
//! store and refreshes the stream TTL; flush errors lengthen the next flush
//! delay exponentially. The buffer is bounded (drop-oldest with a warning)
//! and publishing is rate-limited per run per wall-clock second.

use crate::error::ErrorInfo;
use crate::run::RunStatus;
use camshaft_core::{JobRunId, RunId, StepRunId};
use camshaft_store::{StoreBackend, StoreError, keys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A run lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    #[serde(rename = "run.queued")]
    RunQueued {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "run.success")]
    RunSuccess {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "run.failed")]
    RunFailed {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "run.cancelled")]
    RunCancelled {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job.started")]
    JobStarted {
        run_id: RunId,
        job_id: JobRunId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job went back to the queue for a retry.
    #[serde(rename = "job.queued")]
    JobQueued {
        run_id: RunId,
        job_id: JobRunId,
        attempt: u32,
        retry_delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job.success")]
    JobSuccess {
        run_id: RunId,
        job_id: JobRunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job.failed")]
    JobFailed {
        run_id: RunId,
        job_id: JobRunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job.cancelled")]
    JobCancelled {
        run_id: RunId,
        job_id: JobRunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "step.started")]
    StepStarted {
        run_id: RunId,
        step_id: StepRunId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "step.success")]
    StepSuccess {
        run_id: RunId,
        step_id: StepRunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "step.failed")]
    StepFailed {
        run_id: RunId,
        step_id: StepRunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "step.cancelled")]
    StepCancelled {
        run_id: RunId,
        step_id: StepRunId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "step.skipped")]
    StepSkipped {
        run_id: RunId,
        step_id: StepRunId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Returns the run this event belongs to.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunQueued { run_id, .. }
            | Self::RunStarted { run_id, .. }
            | Self::RunSuccess { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::JobStarted { run_id, .. }
            | Self::JobQueued { run_id, .. }
            | Self::JobSuccess { run_id, .. }
            | Self::JobFailed { run_id, .. }
            | Self::JobCancelled { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepSuccess { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepCancelled { run_id, .. }
            | Self::StepSkipped { run_id, .. } => *run_id,
        }
    }

    /// Builds the terminal run event matching a terminal status.
    #[must_use]
    pub fn run_terminal(run_id: RunId, status: RunStatus, error: Option<ErrorInfo>) -> Self {
        let timestamp = Utc::now();
        match status {
            RunStatus::Failed => Self::RunFailed {
                run_id,
                error,
                timestamp,
            },
            RunStatus::Cancelled => Self::RunCancelled {
                run_id,
                reason: error.map(|e| e.message),
                timestamp,
            },
            _ => Self::RunSuccess { run_id, timestamp },
        }
    }
}

/// Event bridge configuration.
#[derive(Debug, Clone)]
pub struct EventBridgeConfig {
    /// Max entries drained per flush.
    pub max_batch_size: usize,
    /// Base flush interval.
    pub flush_interval: Duration,
    /// Buffer capacity; the oldest entry is dropped beyond it.
    pub max_buffer_size: usize,
    /// Stream TTL, refreshed on each flush.
    pub stream_ttl: Duration,
    /// Per-run events-per-second ceiling; excess is dropped.
    pub max_events_per_second: u32,
}

impl Default for EventBridgeConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(100),
            max_buffer_size: 10_000,
            stream_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            max_events_per_second: 1000,
        }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    second: i64,
    counts: HashMap<RunId, u32>,
}

struct BridgeInner {
    backend: Arc<dyn StoreBackend>,
    config: EventBridgeConfig,
    buffer: Mutex<VecDeque<RunEvent>>,
    rate: Mutex<RateWindow>,
    shutdown: CancellationToken,
}

impl BridgeInner {
    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<RunEvent>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when the run is over its per-second budget.
    fn admit(&self, run_id: RunId) -> bool {
        let now_second = Utc::now().timestamp();
        let mut rate = self.rate.lock().unwrap_or_else(PoisonError::into_inner);
        if rate.second != now_second {
            rate.second = now_second;
            rate.counts.clear();
        }
        let count = rate.counts.entry(run_id).or_insert(0);
        if *count >= self.config.max_events_per_second {
            return false;
        }
        *count += 1;
        true
    }

    /// Drains one batch into per-run streams. Returns the number flushed.
    async fn flush_once(&self) -> Result<usize, StoreError> {
        let batch: Vec<RunEvent> = {
            let mut buffer = self.lock_buffer();
            let take = self.config.max_batch_size.min(buffer.len());
            buffer.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        // Group by run, preserving per-run append order.
        let mut grouped: Vec<(RunId, Vec<String>)> = Vec::new();
        for event in &batch {
            let run_id = event.run_id();
            let payload = match serde_json::to_string(event) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unserializable event");
                    continue;
                }
            };
            match grouped.iter_mut().find(|(id, _)| *id == run_id) {
                Some((_, payloads)) => payloads.push(payload),
                None => grouped.push((run_id, vec![payload])),
            }
        }

        let mut flushed = 0;
        for (index, (run_id, payloads)) in grouped.iter().enumerate() {
            let appended = self
                .backend
                .stream_append(&keys::events(run_id), payloads, self.config.stream_ttl)
                .await;
            if let Err(e) = appended {
                // Re-buffer this and every later group, oldest first, so
                // per-run order survives the failure.
                let mut buffer = self.lock_buffer();
                let mut requeue: Vec<RunEvent> = batch
                    .iter()
                    .filter(|event| {
                        grouped[index..].iter().any(|(id, _)| *id == event.run_id())
                    })
                    .cloned()
                    .collect();
                while let Some(event) = requeue.pop() {
                    buffer.push_front(event);
                }
                return Err(e);
            }
            flushed += payloads.len();
        }
        Ok(flushed)
    }

    fn buffered(&self) -> usize {
        self.lock_buffer().len()
    }
}

/// Buffered, rate-limited appender to per-run event streams.
#[derive(Clone)]
pub struct EventBridge {
    inner: Arc<BridgeInner>,
    flusher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventBridge {
    /// Creates the bridge and starts its background flusher.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, config: EventBridgeConfig) -> Self {
        let inner = Arc::new(BridgeInner {
            backend,
            config,
            buffer: Mutex::new(VecDeque::new()),
            rate: Mutex::new(RateWindow::default()),
            shutdown: CancellationToken::new(),
        });

        let flusher_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let base = flusher_inner.config.flush_interval;
            let max_delay = base.saturating_mul(64);
            let mut delay = base;
            loop {
                tokio::select! {
                    () = flusher_inner.shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                match flusher_inner.flush_once().await {
                    Ok(_) => delay = base,
                    Err(e) => {
                        delay = (delay * 2).min(max_delay);
                        tracing::warn!(error = %e, next_flush = ?delay, "event flush failed, backing off");
                    }
                }
            }
        });

        Self {
            inner,
            flusher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Buffers an event for appending. Never blocks and never fails; an
    /// over-budget or overflowing event is dropped with a warning.
    pub fn publish(&self, event: RunEvent) {
        if !self.inner.admit(event.run_id()) {
            tracing::warn!(run_id = %event.run_id(), "event rate limit exceeded, dropping event");
            return;
        }
        let mut buffer = self.inner.lock_buffer();
        if buffer.len() >= self.inner.config.max_buffer_size {
            buffer.pop_front();
            tracing::warn!("event buffer overflow, dropping oldest event");
        }
        buffer.push_back(event);
    }

    /// Drains the buffer to the store now. Used by tests and shutdown.
    pub async fn flush(&self) -> Result<(), StoreError> {
        while self.inner.flush_once().await? > 0 {}
        Ok(())
    }

    /// Number of events waiting to be flushed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.buffered()
    }

    /// Reads up to `count` events past `cursor`, with their new cursors.
    pub async fn read(
        &self,
        run_id: RunId,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, RunEvent)>, StoreError> {
        let entries = self
            .inner
            .backend
            .stream_read(&keys::events(&run_id), cursor, count)
            .await?;
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<RunEvent>(&entry.payload) {
                Ok(event) => events.push((entry.id, event)),
                Err(e) => {
                    tracing::warn!(error = %e, cursor = %entry.id, "skipping undecodable event");
                }
            }
        }
        Ok(events)
    }

    /// Reads the full event history of a run.
    pub async fn export(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.read(run_id, cursor.as_deref(), 256).await?;
            let Some((last_cursor, _)) = page.last() else {
                break;
            };
            cursor = Some(last_cursor.clone());
            all.extend(page.into_iter().map(|(_, event)| event));
        }
        Ok(all)
    }

    /// Stops the flusher and drains what remains.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = {
            let mut slot = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "final event flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camshaft_store::MemoryStore;

    fn bridge(config: EventBridgeConfig) -> EventBridge {
        EventBridge::new(Arc::new(MemoryStore::new()), config)
    }

    fn queued(run_id: RunId) -> RunEvent {
        RunEvent::RunQueued {
            run_id,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_flush_read_roundtrip() {
        let bridge = bridge(EventBridgeConfig::default());
        let run_id = RunId::new();

        bridge.publish(queued(run_id));
        bridge.publish(RunEvent::RunStarted {
            run_id,
            timestamp: Utc::now(),
        });
        bridge.flush().await.unwrap();

        let events = bridge.read(run_id, None, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].1, RunEvent::RunQueued { .. }));
        assert!(matches!(events[1].1, RunEvent::RunStarted { .. }));

        // Cursor continues past what was read.
        let (cursor, _) = &events[0];
        let rest = bridge.read(run_id, Some(cursor), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn append_order_is_preserved_per_run() {
        let bridge = bridge(EventBridgeConfig {
            max_batch_size: 3,
            ..EventBridgeConfig::default()
        });
        let run_id = RunId::new();
        let other = RunId::new();

        for attempt in 0..5 {
            bridge.publish(RunEvent::JobStarted {
                run_id,
                job_id: JobRunId::new(run_id, "build"),
                attempt,
                timestamp: Utc::now(),
            });
            bridge.publish(queued(other));
        }
        bridge.flush().await.unwrap();

        let events = bridge.export(run_id).await.unwrap();
        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::JobStarted { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![0, 1, 2, 3, 4]);
        assert_eq!(bridge.export(other).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let bridge = bridge(EventBridgeConfig {
            max_buffer_size: 3,
            // Slow flusher so the test controls draining.
            flush_interval: Duration::from_secs(3600),
            ..EventBridgeConfig::default()
        });
        let run_id = RunId::new();

        bridge.publish(queued(run_id));
        for attempt in 0..3 {
            bridge.publish(RunEvent::JobStarted {
                run_id,
                job_id: JobRunId::new(run_id, "build"),
                attempt,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(bridge.buffered(), 3);
        bridge.flush().await.unwrap();

        let events = bridge.export(run_id).await.unwrap();
        // The RunQueued event was the oldest and fell out.
        assert!(events.iter().all(|e| matches!(e, RunEvent::JobStarted { .. })));
    }

    #[tokio::test]
    async fn rate_limit_drops_excess_within_a_second() {
        let bridge = bridge(EventBridgeConfig {
            max_events_per_second: 2,
            flush_interval: Duration::from_secs(3600),
            ..EventBridgeConfig::default()
        });
        let run_id = RunId::new();

        for _ in 0..5 {
            bridge.publish(queued(run_id));
        }
        assert_eq!(bridge.buffered(), 2);

        // Another run has its own budget.
        let other = RunId::new();
        bridge.publish(queued(other));
        assert_eq!(bridge.buffered(), 3);
    }

    #[tokio::test]
    async fn shutdown_drains_the_buffer() {
        let bridge = bridge(EventBridgeConfig {
            flush_interval: Duration::from_secs(3600),
            ..EventBridgeConfig::default()
        });
        let run_id = RunId::new();
        bridge.publish(queued(run_id));

        bridge.shutdown().await;
        assert_eq!(bridge.buffered(), 0);
        assert_eq!(bridge.export(run_id).await.unwrap().len(), 1);
    }

    #[test]
    fn event_type_names_are_dotted() {
        let event = queued(RunId::new());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run.queued");
    }
}
