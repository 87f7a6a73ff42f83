use std::time::Duration;

use async_trait::async_trait;

use crate::LockError;

/// ロックが必要とするキーバリューストアの最小機能。
///
/// 比較付き削除・比較付き TTL 更新は 1 キーに対する原子的な check-then-act でなければならない。
/// Redis では Lua スクリプト、その他のストアでは CAS API やトランザクションで実現する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// キーが存在しない場合のみ `token` を TTL 付きで書き込む。書き込めた場合 true。
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// 格納値が `token` と一致する場合のみ削除する。削除した場合 true。
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// 格納値が `token` と一致する場合のみ TTL を `ttl` に更新する。
    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    async fn exists(&self, key: &str) -> Result<bool, LockError>;

    /// 残り TTL。キーが存在しない、または TTL を持たない場合は None。
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, LockError>;

    /// `prefix` で始まるキーを列挙する (運用時の調査用)。
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, LockError>;
}
