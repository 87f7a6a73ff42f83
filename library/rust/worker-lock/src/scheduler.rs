use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::manager::{DistributedLockManager, RunOutcome};
use crate::options::LockOptions;
use crate::LockError;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// ロック保持中に実行される定期処理。
///
/// 取得できなかった回は単に実行されないため、1 回分のスキップを許容できる処理であること。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

/// 1 回の起動結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    /// 他インスタンスが同じジョブを実行中だった。
    Skipped,
    Failed(String),
}

#[derive(Clone)]
struct ScheduledJob {
    key: String,
    schedule: Schedule,
    options: LockOptions,
    handler: Arc<dyn JobHandler>,
    next_run: Option<DateTime<Utc>>,
}

/// cron 式で起動時刻を決め、各ジョブを分散ロック下で実行するワーカー。
///
/// 複数インスタンスで同じジョブを登録しても、同時刻に実行されるのは 1 インスタンスだけになる。
pub struct CronWorker {
    manager: DistributedLockManager,
    jobs: Vec<ScheduledJob>,
    tick_interval: Duration,
    /// 実行中ループの停止用トークン。`start` ごとに作り直す。
    cancel_token: Mutex<CancellationToken>,
}

impl CronWorker {
    pub fn new(manager: DistributedLockManager) -> Self {
        Self {
            manager,
            jobs: Vec::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// スケジュール評価の間隔を変更する。
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// ジョブを登録する。`key` はそのままロックキーとして使われる。
    ///
    /// cron 式は 5 フィールド (分単位) または 6/7 フィールド (秒あり) を受け付ける。
    pub fn register(
        &mut self,
        key: impl Into<String>,
        cron_expression: &str,
        options: LockOptions,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), LockError> {
        let key = key.into();
        if key.is_empty() {
            return Err(LockError::InvalidKey("job key must not be empty".into()));
        }
        let schedule = parse_schedule(cron_expression)?;
        let next_run = schedule.upcoming(Utc).next();
        tracing::info!(job = %key, cron = %cron_expression, "periodic job registered");
        self.jobs.push(ScheduledJob {
            key,
            schedule,
            options,
            handler,
            next_run,
        });
        Ok(())
    }

    pub fn job_keys(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.key.as_str()).collect()
    }

    /// 登録済みジョブをスケジュールを待たずに 1 回実行する。未登録なら None。
    pub async fn trigger(&self, key: &str) -> Option<JobRun> {
        let job = self.jobs.iter().find(|j| j.key == key)?;
        Some(run_job(&self.manager, &job.key, &job.options, job.handler.clone()).await)
    }

    /// スケジュールループを起動する。`stop` 後に再度呼ぶと新しいループが起動する。
    ///
    /// 前回のループが動いている場合はそれを停止してから起動する。
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let mut jobs = self.jobs.clone();
        let interval = self.tick_interval;
        let token = CancellationToken::new();
        {
            let mut current = self
                .cancel_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            current.cancel();
            *current = token.clone();
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        Self::tick(&manager, &mut jobs, Utc::now());
                    }
                }
            }
            tracing::info!("cron worker stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// 期限が到来したジョブを起動し、次回時刻を進める。起動したジョブ数を返す。
    fn tick(
        manager: &DistributedLockManager,
        jobs: &mut [ScheduledJob],
        now: DateTime<Utc>,
    ) -> usize {
        let mut dispatched = 0;
        for job in jobs.iter_mut() {
            let Some(next_run) = job.next_run else {
                continue;
            };
            if next_run > now {
                continue;
            }
            job.next_run = job.schedule.after(&now).next();

            let manager = manager.clone();
            let key = job.key.clone();
            let options = job.options.clone();
            let handler = job.handler.clone();
            tokio::spawn(async move {
                run_job(&manager, &key, &options, handler).await;
            });
            dispatched += 1;
        }
        dispatched
    }
}

async fn run_job(
    manager: &DistributedLockManager,
    key: &str,
    options: &LockOptions,
    handler: Arc<dyn JobHandler>,
) -> JobRun {
    match manager
        .run_exclusively(key, options, || async move { handler.run().await })
        .await
    {
        Ok(RunOutcome::Executed(())) => {
            tracing::debug!(job = %key, "periodic job completed");
            JobRun::Completed
        }
        Ok(RunOutcome::Skipped) => {
            tracing::debug!(
                job = %key,
                "periodic job skipped; another instance is already running it"
            );
            JobRun::Skipped
        }
        Err(e) => {
            tracing::error!(job = %key, error = %e, "periodic job failed");
            JobRun::Failed(e.to_string())
        }
    }
}

/// 5 フィールドの標準 cron 式には秒フィールド "0" を補う。
fn parse_schedule(expression: &str) -> Result<Schedule, LockError> {
    let full_expr = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&full_expr).map_err(|e| LockError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}
