//! The store backend seam.
//!
//! The engine coordinates exclusively through a shared key-value store with
//! three capabilities:
//!
//! - plain keys with optional TTL and compare-and-set semantics (run
//!   documents, idempotency keys, concurrency locks, job leases)
//! - scored sets (ready queues ordered by availability time, the run index
//!   ordered by creation time)
//! - append-only streams with cursor reads (per-run event history)
//!
//! This abstraction allows the engine to be tested against [`MemoryStore`]
//! while production deployments use [`RedisStore`].
//!
//! [`MemoryStore`]: crate::memory::MemoryStore
//! [`RedisStore`]: crate::redis::RedisStore

use async_trait::async_trait;
use std::time::Duration;

/// A member of a scored set together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    /// The member payload.
    pub member: String,
    /// The member's score (epoch milliseconds for queue entries).
    pub score: f64,
}

/// A single entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Opaque, monotonically increasing cursor for this entry.
    pub id: String,
    /// The entry payload.
    pub payload: String,
}

/// Errors from store backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to connect to the backing store.
    ConnectionFailed { message: String },
    /// A store operation failed.
    OperationFailed { message: String },
    /// The store returned data in an unexpected shape.
    UnexpectedReply { message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "store connection failed: {message}")
            }
            Self::OperationFailed { message } => write!(f, "store operation failed: {message}"),
            Self::UnexpectedReply { message } => {
                write!(f, "unexpected reply from store: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Trait for the shared coordination store.
///
/// All values are strings; callers are responsible for serialization (the
/// engine stores JSON documents wrapped in a versioned envelope).
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Reads the value of a key, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a key, replacing any previous value.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Writes a key only if it does not already exist.
    ///
    /// Returns `true` if this call created the key. This is the
    /// compare-and-set primitive behind idempotency keys, concurrency-group
    /// locks and job leases.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Deletes a key. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Deletes a key only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted. Used for owner-checked release
    /// of locks and leases.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Resets the TTL of an existing key.
    ///
    /// Returns `false` if the key does not exist.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Adds a member to a scored set, updating its score if already present.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Removes a member from a scored set.
    ///
    /// Returns `true` if the member was present. When several processes race
    /// to claim the same member, exactly one of them observes `true`; that
    /// caller owns the member.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Reads up to `limit` members with score `<= max_score`, lowest first.
    async fn zrange_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Reads up to `limit` members ordered by descending score.
    async fn zrange_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Appends entries to a stream and refreshes the stream's TTL.
    async fn stream_append(
        &self,
        key: &str,
        payloads: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Reads up to `count` entries strictly after `cursor`.
    ///
    /// A `None` cursor reads from the start of the stream.
    async fn stream_read(
        &self,
        key: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;
}
