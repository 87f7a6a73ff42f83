use thiserror::Error;

/// ストア操作で発生するエラー。
///
/// マネージャーはこれらを呼び出し側へ伝播させず、`None` / `false` に変換してログに記録する。
#[derive(Debug, Error)]
pub enum LockError {
    #[error("ストアへの接続に失敗しました: {0}")]
    Connection(String),
    #[error("ストアコマンドの実行に失敗しました: {0}")]
    Command(String),
    #[error("不正なロックキーです: {0}")]
    InvalidKey(String),
    #[error("不正な cron 式です ({expression}): {reason}")]
    InvalidSchedule { expression: String, reason: String },
}

/// ロック設定の読み込み・検証エラー。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ロック設定ファイルを読み込めません ({path}): {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ロック設定の YAML を解析できません: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("ロック設定が不正です: {0}")]
    Validation(String),
}
