//! Redis-backed store implementation.
//!
//! Maps the [`StoreBackend`] contract onto Redis primitives:
//!
//! - keys: `GET` / `SET` (`PX` for TTL, `NX` for compare-and-set), owner
//!   checked release via a `GET`+`DEL` Lua script
//! - scored sets: `ZADD` / `ZREM` / `ZRANGEBYSCORE` / `ZREVRANGE`; the
//!   `ZREM` return value arbitrates competing claimers
//! - streams: pipelined `XADD` plus `EXPIRE`, cursor reads via `XRANGE`
//!   with an exclusive start id
//!
//! Connections go through [`redis::aio::ConnectionManager`], which
//! re-establishes dropped connections transparently.

use crate::backend::{ScoredMember, StoreBackend, StoreError, StreamEntry};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

/// Atomically deletes a key when its value matches the caller's token.
const DELETE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Field name used for stream entry payloads.
const STREAM_PAYLOAD_FIELD: &str = "payload";

/// A [`StoreBackend`] over a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis at the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the initial connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::ConnectionFailed {
            message: e.to_string(),
        })?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                message: e.to_string(),
            })?;
        Ok(Self { conn })
    }

    /// Wraps an already-established connection manager.
    #[must_use]
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn op_err(e: redis::RedisError) -> StoreError {
        StoreError::OperationFailed {
            message: e.to_string(),
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        // Redis rejects PX 0; clamp to the smallest expirable unit.
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// Formats the start argument for an exclusive `XRANGE` read.
    fn range_start(cursor: Option<&str>) -> String {
        match cursor {
            Some(id) => format!("({id}"),
            None => "-".to_string(),
        }
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(Self::op_err)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::ttl_millis(ttl));
        }
        cmd.arg("NX");
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(Self::op_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(DELETE_IF_EQUALS_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::op_err)?;
        Ok(removed > 0)
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)?;
        Ok(updated > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)?;
        Ok(reply
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn zrange_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = limit - 1;
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)
    }

    async fn stream_append(
        &self,
        key: &str,
        payloads: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for payload in payloads {
            pipe.cmd("XADD")
                .arg(key)
                .arg("*")
                .arg(STREAM_PAYLOAD_FIELD)
                .arg(payload)
                .ignore();
        }
        pipe.cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ttl_millis(ttl))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(Self::op_err)?;
        Ok(())
    }

    async fn stream_read(
        &self,
        key: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<(String, HashMap<String, String>)> = redis::cmd("XRANGE")
            .arg(key)
            .arg(Self::range_start(cursor))
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(Self::op_err)?;

        reply
            .into_iter()
            .map(|(id, mut fields)| {
                let payload =
                    fields
                        .remove(STREAM_PAYLOAD_FIELD)
                        .ok_or_else(|| StoreError::UnexpectedReply {
                            message: format!("stream entry {id} has no payload field"),
                        })?;
                Ok(StreamEntry { id, payload })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_start_is_exclusive_past_cursor() {
        assert_eq!(RedisStore::range_start(None), "-");
        assert_eq!(RedisStore::range_start(Some("1700000000000-3")), "(1700000000000-3");
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(RedisStore::ttl_millis(Duration::from_nanos(1)), 1);
        assert_eq!(RedisStore::ttl_millis(Duration::from_secs(2)), 2000);
    }
}
