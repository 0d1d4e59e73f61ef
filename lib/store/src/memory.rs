//! In-memory store backend.
//!
//! Implements the full [`StoreBackend`] contract against process-local
//! state. Expired keys are dropped lazily on access. Used throughout the
//! engine's tests and suitable for single-process embedding where no
//! cross-process coordination is needed.

use crate::backend::{ScoredMember, StoreBackend, StoreError, StreamEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<StreamEntry>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, ValueEntry>,
    sets: HashMap<String, Vec<ScoredMember>>,
    streams: HashMap<String, Stream>,
}

/// An in-memory [`StoreBackend`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_value(state: &mut State, key: &str, now: Instant) -> Option<String> {
        match state.values.get(key) {
            Some(entry) if entry.is_expired(now) => {
                state.values.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        Ok(Self::live_value(&mut state, key, Instant::now()))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.lock();
        if Self::live_value(&mut state, key, now).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.values.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.lock();
        match Self::live_value(&mut state, key, now) {
            Some(value) if value == expected => {
                state.values.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.lock();
        if Self::live_value(&mut state, key, now).is_none() {
            return Ok(false);
        }
        if let Some(entry) = state.values.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut state = self.lock();
        let set = state.sets.entry(key.to_string()).or_default();
        set.retain(|m| m.member != member);
        set.push(ScoredMember {
            member: member.to_string(),
            score,
        });
        // Score order first, member order as the stable tie-break.
        set.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.member.cmp(&b.member))
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(set) = state.sets.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|m| m.member != member);
        Ok(set.len() < before)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let state = self.lock();
        let Some(set) = state.sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .iter()
            .filter(|m| m.score <= max_score)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn zrange_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let Some(set) = state.sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .iter()
            .rev()
            .take(limit)
            .map(|m| m.member.clone())
            .collect())
    }

    async fn stream_append(
        &self,
        key: &str,
        payloads: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.lock();
        let stream = state.streams.entry(key.to_string()).or_default();
        if stream.expires_at.is_some_and(|at| at <= now) {
            stream.entries.clear();
            stream.next_seq = 0;
        }
        for payload in payloads {
            stream.next_seq += 1;
            stream.entries.push(StreamEntry {
                id: stream.next_seq.to_string(),
                payload: payload.clone(),
            });
        }
        stream.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn stream_read(
        &self,
        key: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let now = Instant::now();
        let state = self.lock();
        let Some(stream) = state.streams.get(key) else {
            return Ok(Vec::new());
        };
        if stream.expires_at.is_some_and(|at| at <= now) {
            return Ok(Vec::new());
        }
        let after = match cursor {
            Some(raw) => raw.parse::<u64>().map_err(|e| StoreError::UnexpectedReply {
                message: format!("bad stream cursor {raw:?}: {e}"),
            })?,
            None => 0,
        };
        Ok(stream
            .entries
            .iter()
            .filter(|e| e.id.parse::<u64>().map(|seq| seq > after).unwrap_or(false))
            .take(count)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("lock", "a", None).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", None).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn ttl_expires_values() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // An expired lock can be re-taken.
        assert!(store.set_if_absent("k", "w", None).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_checks_owner() {
        let store = MemoryStore::new();
        store.set("lease", "owner-1", None).await.unwrap();
        assert!(!store.delete_if_equals("lease", "owner-2").await.unwrap());
        assert!(store.delete_if_equals("lease", "owner-1").await.unwrap());
        assert_eq!(store.get("lease").await.unwrap(), None);
    }

    #[tokio::test]
    async fn extend_ttl_requires_existing_key() {
        let store = MemoryStore::new();
        assert!(!store
            .extend_ttl("missing", Duration::from_secs(1))
            .await
            .unwrap());
        store.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        assert!(store.extend_ttl("k", Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn scored_set_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("q", "late", 300.0).await.unwrap();
        store.zadd("q", "early", 100.0).await.unwrap();
        store.zadd("q", "mid", 200.0).await.unwrap();

        let members = store.zrange_by_score("q", 250.0, 10).await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["early", "mid"]);

        let desc = store.zrange_desc("q", 2).await.unwrap();
        assert_eq!(desc, vec!["late".to_string(), "mid".to_string()]);
    }

    #[tokio::test]
    async fn zrem_claims_exactly_once() {
        let store = MemoryStore::new();
        store.zadd("q", "entry", 1.0).await.unwrap();
        assert!(store.zrem("q", "entry").await.unwrap());
        assert!(!store.zrem("q", "entry").await.unwrap());
    }

    #[tokio::test]
    async fn stream_reads_past_cursor() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store
            .stream_append("s", &["a".to_string(), "b".to_string()], ttl)
            .await
            .unwrap();
        store.stream_append("s", &["c".to_string()], ttl).await.unwrap();

        let all = store.stream_read("s", None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let tail = store.stream_read("s", Some(&all[1].id), 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload, "c");
    }
}
