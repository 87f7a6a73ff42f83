use chrono::Utc;
use uuid::Uuid;

const LOCAL_TOKEN_PREFIX: &str = "local";

/// 取得試行ごとのトークンを生成する。
///
/// トークンはインスタンス ID・プロセス ID・ミリ秒タイムスタンプ・UUIDv4 を連結したもの。
/// 時刻がずれていても UUID 部分で衝突しない。
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    instance_id: String,
    pid: u32,
}

impl TokenGenerator {
    pub fn new(instance_id: Option<&str>) -> Self {
        let instance_id = instance_id
            .filter(|id| !id.is_empty())
            .map_or_else(|| Uuid::new_v4().simple().to_string(), str::to_string);
        Self {
            instance_id,
            pid: std::process::id(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn next_token(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.instance_id,
            self.pid,
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        )
    }

    /// 無効化モードで返すストアを介さないトークン。
    pub fn local_token(&self) -> String {
        format!("{}:{}", LOCAL_TOKEN_PREFIX, Uuid::new_v4().simple())
    }
}
