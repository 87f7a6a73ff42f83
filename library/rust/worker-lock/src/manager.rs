use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::config::LockManagerConfig;
use crate::options::LockOptions;
use crate::store::LockStore;
use crate::token::TokenGenerator;

/// 取得に成功したロック。`key` は論理名 (プレフィックスなし)。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

/// `run_exclusively` の結果。
///
/// `Skipped` は他インスタンスがロックを保持していたため処理を実行しなかったことを表し、
/// 「実行したが値を返さなかった」(`Executed(())`) とは区別される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Executed(T),
    Skipped,
}

impl<T> RunOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped)
    }

    pub fn executed(self) -> Option<T> {
        match self {
            RunOutcome::Executed(value) => Some(value),
            RunOutcome::Skipped => None,
        }
    }
}

/// 共有キーバリューストア上の名前付き分散ロックを管理する。
///
/// マネージャー自身は権威ある状態を持たず、排他の正しさはストアの原子操作に委ねる。
/// そのため `Clone` して複数タスクから同時に使ってよい。
///
/// ストア障害はすべて `None` / `false` に変換され、呼び出し側にエラーとして伝播しない。
#[derive(Clone)]
pub struct DistributedLockManager {
    store: Option<Arc<dyn LockStore>>,
    config: LockManagerConfig,
    tokens: TokenGenerator,
}

impl DistributedLockManager {
    /// 注入されたストアでマネージャーを構築する。
    ///
    /// `config.enabled` が false の場合はストアを保持せず、全操作がストアを介さない no-op になる。
    pub fn new(config: LockManagerConfig, store: Arc<dyn LockStore>) -> Self {
        if !config.enabled {
            tracing::info!("distributed lock is disabled; locks are local no-ops");
            return Self::without_store(config);
        }
        let tokens = TokenGenerator::new(config.instance_id.as_deref());
        tracing::info!(
            key_prefix = %config.key_prefix,
            instance_id = %tokens.instance_id(),
            "distributed lock manager initialized"
        );
        Self {
            store: Some(store),
            config,
            tokens,
        }
    }

    /// ストアを持たない (無効化された) マネージャーを構築する。
    pub fn disabled(config: LockManagerConfig) -> Self {
        Self::without_store(config)
    }

    /// 設定のエンドポイントへ Redis 接続してマネージャーを構築する。
    ///
    /// エンドポイント未設定や接続失敗ではプロセスを落とさず、エラーログを出したうえで
    /// 無効化モードにフォールバックする。
    #[cfg(feature = "redis")]
    pub async fn connect(config: LockManagerConfig) -> Self {
        if !config.enabled {
            tracing::info!("distributed lock is disabled; locks are local no-ops");
            return Self::without_store(config);
        }
        if config.is_misconfigured() {
            tracing::error!(
                "distributed lock is enabled but store_endpoint is not configured; \
                 falling back to local no-op locks"
            );
            return Self::without_store(config);
        }
        let endpoint = config.store_endpoint.clone().unwrap_or_default();
        match crate::redis::RedisLockStore::connect(&endpoint).await {
            Ok(store) => Self::new(config, Arc::new(store)),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to connect to lock store; falling back to local no-op locks"
                );
                Self::without_store(config)
            }
        }
    }

    fn without_store(config: LockManagerConfig) -> Self {
        let tokens = TokenGenerator::new(config.instance_id.as_deref());
        Self {
            store: None,
            config,
            tokens,
        }
    }

    /// ストアと連携して排他制御を行っているか。
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// 論理キーを名前空間付きのストアキーに変換する。
    pub fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// ロックを取得する。
    ///
    /// `1 + retry_count` 回まで試行し、すべて失敗した場合は `None` を返す。
    /// 取得失敗は他インスタンスが処理中であることを意味する通常の結果であり、エラーではない。
    pub async fn acquire(&self, key: &str, options: &LockOptions) -> Option<LockGuard> {
        let Some(store) = &self.store else {
            return Some(LockGuard {
                key: key.to_string(),
                token: self.tokens.local_token(),
            });
        };
        if key.is_empty() {
            tracing::warn!("lock key must not be empty");
            return None;
        }

        let resolved = options.resolve(&self.config);
        let full_key = self.full_key(key);
        let attempts = resolved.max_attempts();

        for attempt in 0..attempts {
            let token = self.tokens.next_token();
            match store.set_if_absent(&full_key, &token, resolved.ttl).await {
                Ok(true) => {
                    tracing::debug!(key = %key, attempt = attempt + 1, "lock acquired");
                    return Some(LockGuard {
                        key: key.to_string(),
                        token,
                    });
                }
                Ok(false) => {
                    tracing::debug!(key = %key, attempt = attempt + 1, "lock is held elsewhere");
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        attempt = attempt + 1,
                        error = %e,
                        "lock store error during acquire"
                    );
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(resolved.delay_before_retry(attempt)).await;
            }
        }

        tracing::debug!(key = %key, attempts, "lock not acquired");
        None
    }

    /// トークンが一致する場合のみロックを解放する。
    ///
    /// 一致しない (既に期限切れで他者が取得済み) 場合やストア障害時は false を返す。
    pub async fn release(&self, key: &str, token: &str) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        if key.is_empty() {
            tracing::warn!("lock key must not be empty");
            return false;
        }
        release_in_store(store.as_ref(), key, &self.full_key(key), token).await
    }

    /// トークンが一致する場合のみ TTL を `ttl` に更新する。
    pub async fn extend(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        if key.is_empty() {
            tracing::warn!("lock key must not be empty");
            return false;
        }
        match store
            .compare_and_expire(&self.full_key(key), token, ttl)
            .await
        {
            Ok(true) => {
                tracing::debug!(key = %key, ttl = ?ttl, "lock extended");
                true
            }
            Ok(false) => {
                tracing::warn!(key = %key, "lock extend rejected; token no longer owns the lock");
                false
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "lock store error during extend");
                false
            }
        }
    }

    /// ロックキーが存在するか (保持者は問わない)。
    ///
    /// 診断用。取得判断に使うと競合するため、必ず `acquire` を使うこと。
    pub async fn exists(&self, key: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if key.is_empty() {
            return false;
        }
        match store.exists(&self.full_key(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "lock store error during exists");
                false
            }
        }
    }

    /// ロックの残り TTL。
    pub async fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let store = self.store.as_ref()?;
        if key.is_empty() {
            return None;
        }
        match store.remaining_ttl(&self.full_key(key)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "lock store error during ttl lookup");
                None
            }
        }
    }

    /// 現在保持されているロックの論理キー一覧。
    pub async fn held_locks(&self) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let prefix = self.full_key("");
        match store.keys_with_prefix(&prefix).await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "lock store error while listing locks");
                Vec::new()
            }
        }
    }

    /// ロックを取得できた場合のみ `work` を実行し、終了経路にかかわらず解放を試みる。
    ///
    /// 取得できなかった場合 `work` は呼ばれず `RunOutcome::Skipped` を返す。
    /// `work` のエラーはそのまま返し、パニックは解放後に再送出する。
    /// 実行中に future が破棄された場合も、ランタイム上で解放を試みる。
    pub async fn run_exclusively<F, Fut, T, E>(
        &self,
        key: &str,
        options: &LockOptions,
        work: F,
    ) -> Result<RunOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(guard) = self.acquire(key, options).await else {
            tracing::debug!(key = %key, "skipped; another instance is already running this");
            return Ok(RunOutcome::Skipped);
        };

        let mut cleanup = ReleaseOnDrop {
            store: self.store.clone(),
            key: guard.key.clone(),
            full_key: self.full_key(&guard.key),
            token: guard.token.clone(),
            armed: true,
        };

        let result = AssertUnwindSafe(async { work().await }).catch_unwind().await;

        self.release(&guard.key, &guard.token).await;
        cleanup.armed = false;

        match result {
            Ok(outcome) => outcome.map(RunOutcome::Executed),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

async fn release_in_store(store: &dyn LockStore, key: &str, full_key: &str, token: &str) -> bool {
    match store.compare_and_delete(full_key, token).await {
        Ok(true) => {
            tracing::debug!(key = %key, "lock released");
            true
        }
        Ok(false) => {
            tracing::warn!(key = %key, "lock release rejected; token no longer owns the lock");
            false
        }
        Err(e) => {
            tracing::error!(key = %key, error = %e, "lock store error during release");
            false
        }
    }
}

/// `run_exclusively` の future が完了前に破棄された場合の解放。
struct ReleaseOnDrop {
    store: Option<Arc<dyn LockStore>>,
    key: String,
    full_key: String,
    token: String,
    armed: bool,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(store) = self.store.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "no runtime to release lock; it will expire by ttl");
            return;
        };
        let key = std::mem::take(&mut self.key);
        let full_key = std::mem::take(&mut self.full_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            release_in_store(store.as_ref(), &key, &full_key, &token).await;
        });
    }
}
