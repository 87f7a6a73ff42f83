use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::store::LockStore;
use crate::LockError;

/// Redis-backed lock store.
///
/// Acquisition is an atomic `SET key token NX PX ttl`. Release and extension run
/// Lua scripts so that the token comparison and the mutation happen as a single
/// server-side step.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    release_script: Script,
    extend_script: Script,
}

/// Lua script for safe lock release.
/// Only deletes the key if the stored value matches the token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Lua script for safe lock extension.
/// Only extends TTL if the stored value matches the token.
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const SCAN_BATCH: usize = 100;

impl RedisLockStore {
    /// Connect to Redis using a URL such as `redis://127.0.0.1:6379`.
    ///
    /// The connection manager reconnects on its own after the initial connection,
    /// so a Redis restart surfaces as per-operation errors rather than a dead store.
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_connection_error)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(map_connection_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Create a store from an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        // Atomic SET key value NX PX milliseconds
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(result == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(result == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await.map_err(map_redis_error)?;
        Ok(exists)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, LockError> {
        let mut conn = self.conn.clone();
        let millis: i64 = conn.pttl(key).await.map_err(map_redis_error)?;
        Ok(pttl_to_duration(millis))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, LockError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// PTTL returns -2 for a missing key and -1 for a key without expiry.
fn pttl_to_duration(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

/// Escape glob metacharacters so the prefix is matched literally by SCAN MATCH.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn map_connection_error(err: RedisError) -> LockError {
    LockError::Connection(err.to_string())
}

fn map_redis_error(err: RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        LockError::Connection(err.to_string())
    } else {
        LockError::Command(err.to_string())
    }
}
