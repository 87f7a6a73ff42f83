use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_KEY_PREFIX: &str = "lock";
pub const DEFAULT_TTL_MS: u64 = 30_000;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;

/// ロックマネージャーのプロセス全体設定。
///
/// 構築時に一度だけ注入する。環境変数などのグローバル状態は参照しない。
///
/// ```yaml
/// enabled: true
/// store_endpoint: "redis://127.0.0.1:6379"
/// key_prefix: "exchange:lock"
/// default_ttl_ms: 30000
/// default_retry_count: 3
/// default_retry_delay_ms: 200
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LockManagerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub store_endpoint: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// トークンに埋め込むインスタンス識別子。未指定時は起動ごとに生成する。
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_ttl_ms() -> u64 {
    DEFAULT_TTL_MS
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            store_endpoint: None,
            key_prefix: default_key_prefix(),
            instance_id: None,
            default_ttl_ms: DEFAULT_TTL_MS,
            default_retry_count: DEFAULT_RETRY_COUNT,
            default_retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl LockManagerConfig {
    /// 無効化された設定を返す。単一インスタンス構成向け。
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.store_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = duration_to_millis(ttl);
        self
    }

    pub fn with_default_retry_count(mut self, retry_count: u32) -> Self {
        self.default_retry_count = retry_count;
        self
    }

    pub fn with_default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay_ms = duration_to_millis(delay);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    /// 有効かつエンドポイントが設定されていない状態。起動時に誤設定として扱う。
    pub fn is_misconfigured(&self) -> bool {
        self.enabled
            && self
                .store_endpoint
                .as_deref()
                .map_or(true, |endpoint| endpoint.trim().is_empty())
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// ロック設定 YAML を読み込む。`env_path` があれば環境別の上書きをマージしてから検証する。
///
/// 空ファイルはすべて既定値として扱う。マージ後の値が `validate` を通らなければエラー。
pub fn load(base_path: &str, env_path: Option<&str>) -> Result<LockManagerConfig, ConfigError> {
    let mut merged = read_yaml(base_path)?;
    if let Some(env) = env_path {
        let overlay = read_yaml(env)?;
        merge_yaml(&mut merged, &overlay);
    }

    let config: LockManagerConfig = serde_yaml::from_value(merged)?;
    validate(&config)?;
    tracing::debug!(
        path = %base_path,
        enabled = config.enabled,
        key_prefix = %config.key_prefix,
        "lock manager config loaded"
    );
    Ok(config)
}

fn read_yaml(path: &str) -> Result<serde_yaml::Value, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    // 空ファイルは null になる
    Ok(match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        other => other,
    })
}

/// 設定値のバリデーション。
///
/// エンドポイント欠落はここではエラーにしない。マネージャー構築時にログを出して無効化扱いにする。
pub fn validate(config: &LockManagerConfig) -> Result<(), ConfigError> {
    if config.key_prefix.is_empty() {
        return Err(ConfigError::Validation("key_prefix is required".into()));
    }
    if config.default_ttl_ms == 0 {
        return Err(ConfigError::Validation("default_ttl_ms must be > 0".into()));
    }
    if let Some(endpoint) = &config.store_endpoint {
        if !endpoint.is_empty()
            && !endpoint.starts_with("redis://")
            && !endpoint.starts_with("rediss://")
        {
            return Err(ConfigError::Validation(
                "store_endpoint must start with redis:// or rediss://".into(),
            ));
        }
    }
    Ok(())
}

/// `overlay` のキーで `base` を再帰的に上書きする。マッピング以外の値は丸ごと置き換える。
pub fn merge_yaml(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(key) {
                    merge_yaml(base_value, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}
