//! worker-lock: 定期ワーカー向け分散ロックライブラリ。
//!
//! 共有キーバリューストア (Redis) 上の名前付きロックで、複数インスタンスにまたがる
//! 定期処理 (ティッカー更新・ローソク足生成・注文失効・入金反映など) を直列化する。
//! リース TTL によりロック保持中にプロセスが落ちても自動で回復する。

pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod options;
#[cfg(feature = "redis")]
pub mod redis;
pub mod scheduler;
pub mod store;
pub mod token;

pub use config::LockManagerConfig;
pub use error::{ConfigError, LockError};
pub use manager::{DistributedLockManager, LockGuard, RunOutcome};
pub use memory::InMemoryLockStore;
pub use options::{Backoff, LockOptions, ResolvedLockOptions};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use scheduler::{CronWorker, JobHandler, JobRun};
pub use store::LockStore;

#[cfg(feature = "mock")]
pub use store::MockLockStore;
