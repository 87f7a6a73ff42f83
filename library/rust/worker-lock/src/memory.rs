use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::LockStore;
use crate::LockError;

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// `Instant` に加算できない TTL はこの時間で頭打ちにする (100 年)。
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_TTL))
        .unwrap_or(now)
}

impl LockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// プロセス内で完結する `LockStore` 実装。
///
/// 単一プロセス内のテストや、複数スレッド間でのみ排他が必要な構成で使う。
/// 期限切れエントリはアクセス時に遅延削除する。
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 期限切れを除いた保持中のキー数。
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        locks.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if !entry.is_expired(now) {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: expiry_after(now, ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if entry.is_expired(now) => {
                locks.remove(key);
                Ok(false)
            }
            Some(entry) if entry.token == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get_mut(key) {
            Some(entry) if !entry.is_expired(now) && entry.token == token => {
                entry.expires_at = expiry_after(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        Ok(locks.get(key).map_or(false, |e| !e.is_expired(now)))
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, LockError> {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        Ok(locks
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at.saturating_duration_since(now)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, LockError> {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        let mut keys: Vec<String> = locks
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_and_compare_and_delete() {
        let store = InMemoryLockStore::new();
        assert!(store
            .set_if_absent("lock:a", "t1", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(store.exists("lock:a").await.unwrap());

        assert!(store.compare_and_delete("lock:a", "t1").await.unwrap());
        assert!(!store.exists("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_set_if_absent_is_rejected() {
        let store = InMemoryLockStore::new();
        assert!(store
            .set_if_absent("lock:a", "t1", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock:a", "t2", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_with_wrong_token_keeps_key() {
        let store = InMemoryLockStore::new();
        store
            .set_if_absent("lock:a", "t1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!store.compare_and_delete("lock:a", "wrong").await.unwrap());
        assert!(store.exists("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_missing_key() {
        let store = InMemoryLockStore::new();
        assert!(!store.compare_and_delete("lock:none", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_expire_updates_ttl() {
        let store = InMemoryLockStore::new();
        store
            .set_if_absent("lock:a", "t1", Duration::from_millis(500))
            .await
            .unwrap();
        assert!(store
            .compare_and_expire("lock:a", "t1", Duration::from_secs(60))
            .await
            .unwrap());
        let ttl = store.remaining_ttl("lock:a").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_compare_and_expire_with_wrong_token() {
        let store = InMemoryLockStore::new();
        store
            .set_if_absent("lock:a", "t1", Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!store
            .compare_and_expire("lock:a", "t2", Duration::from_secs(60))
            .await
            .unwrap());
        let ttl = store.remaining_ttl("lock:a").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let store = InMemoryLockStore::new();
        store
            .set_if_absent("lock:a", "t1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!store.exists("lock:a").await.unwrap());
        assert!(store.remaining_ttl("lock:a").await.unwrap().is_none());
        assert!(!store
            .compare_and_expire("lock:a", "t1", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store
            .set_if_absent("lock:a", "t2", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let store = InMemoryLockStore::new();
        assert!(store
            .set_if_absent("lock:a", "t1", Duration::MAX)
            .await
            .unwrap());
        assert!(store.exists("lock:a").await.unwrap());
        assert!(store
            .compare_and_expire("lock:a", "t1", Duration::MAX)
            .await
            .unwrap());
        let ttl = store.remaining_ttl("lock:a").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(365 * 24 * 60 * 60));
        assert!(store.compare_and_delete("lock:a", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(10);
        store.set_if_absent("lock:b", "t", ttl).await.unwrap();
        store.set_if_absent("lock:a", "t", ttl).await.unwrap();
        store.set_if_absent("other:c", "t", ttl).await.unwrap();

        let keys = store.keys_with_prefix("lock:").await.unwrap();
        assert_eq!(keys, vec!["lock:a".to_string(), "lock:b".to_string()]);
        assert_eq!(store.len().await, 3);
    }
}
