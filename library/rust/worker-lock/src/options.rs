use std::time::Duration;

use crate::config::LockManagerConfig;

/// リトライ間隔の戦略。
///
/// 既定は固定間隔。指数バックオフは高競合時の一斉リトライを緩和したい場合のみ明示的に選ぶ。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential { multiplier: f64, max_delay: Duration },
}

/// 呼び出し単位のロック設定。未指定の項目はマネージャーの既定値で補完される。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockOptions {
    pub ttl: Option<Duration>,
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub backoff: Backoff,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// プロセス既定値とマージした実効設定を返す。
    pub fn resolve(&self, config: &LockManagerConfig) -> ResolvedLockOptions {
        ResolvedLockOptions {
            ttl: self.ttl.unwrap_or_else(|| config.default_ttl()),
            retry_count: self.retry_count.unwrap_or(config.default_retry_count),
            retry_delay: self
                .retry_delay
                .unwrap_or_else(|| config.default_retry_delay()),
            backoff: self.backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLockOptions {
    pub ttl: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
}

impl ResolvedLockOptions {
    /// 初回を含む総試行回数。
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// `retry` 回目 (0 始まり) のリトライ前に待機する時間。
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let base = self.retry_delay.as_millis() as f64 * multiplier.powi(exponent);
                let capped = base.min(max_delay.as_millis() as f64);
                if capped.is_finite() && capped >= 0.0 {
                    Duration::from_millis(capped as u64)
                } else {
                    max_delay
                }
            }
        }
    }
}
