//! 网关配置
//!
//! `GatewayConfig` 从 TOML 文件加载；运行期可变的部分（请求体日志开关、备用 API 配置、
//! 用量上报协作者）放在 `ConfigStore` 中，以带版本号的不可变快照形式发布。
//! 每个请求在进入时取一次快照，整个请求期间不再读取共享字段。

use crate::collab::{LogUsageReporter, UsageReporter};
use crate::error::AppError;
use crate::proxy::providers::ProviderProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 15721;

/// 备用 API（统一聚合端点）配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternateApiConfig {
    pub enabled: bool,
    pub url: String,
    pub token: String,
}

impl AlternateApiConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            token: token.into(),
        }
    }

    /// 开启且配置可用
    pub fn is_complete(&self) -> bool {
        self.enabled && self.problem().is_none()
    }

    /// 配置不可用的原因：URL 或 token 为空、URL 无法解析或不是 http(s)
    pub fn problem(&self) -> Option<String> {
        let url = self.url.trim();
        if url.is_empty() {
            return Some("url 为空".to_string());
        }
        if self.token.trim().is_empty() {
            return Some("token 为空".to_string());
        }
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => None,
            Ok(parsed) => Some(format!("url 协议不受支持: {}", parsed.scheme())),
            Err(e) => Some(format!("url 无效 '{url}': {e}")),
        }
    }
}

/// 超时配置（秒），0 表示不限制
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_secs: u64,
    /// 从发出请求到收到响应头
    pub send_timeout_secs: u64,
    /// 响应体相邻两个分块之间
    pub idle_read_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            send_timeout_secs: 600,
            idle_read_timeout_secs: 300,
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        secs(self.connect_timeout_secs)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        secs(self.send_timeout_secs)
    }

    pub fn idle_read_timeout(&self) -> Option<Duration> {
        secs(self.idle_read_timeout_secs)
    }
}

/// 进程级配置，启动时加载一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub log_body: bool,
    pub alternate_api: AlternateApiConfig,
    pub timeouts: TimeoutConfig,
    pub shutdown_grace_secs: u64,
    pub providers: Vec<ProviderProfile>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            log_body: false,
            alternate_api: AlternateApiConfig::default(),
            timeouts: TimeoutConfig::default(),
            shutdown_grace_secs: 10,
            providers: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// 默认配置文件路径：`<config_dir>/provider-relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("provider-relay").join("config.toml"))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, AppError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Err(AppError::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::io(path.display().to_string(), e))?;
        let config = Self::from_toml_str(&content)?;
        log::info!(
            "[Config] 已加载 {}: {} 个供应商",
            path.display(),
            config.providers.len()
        );
        Ok(config)
    }

    /// 显式路径必须存在；未指定时默认路径缺失则使用默认配置
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, AppError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                log::warn!("[Config] 未找到配置文件，使用默认配置");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(AppError::Invalid("provider id 不能为空".to_string()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(AppError::Invalid(format!(
                    "provider id 重复: {}",
                    provider.id
                )));
            }
            url::Url::parse(&provider.base_url).map_err(|e| {
                AppError::Invalid(format!(
                    "provider {} 的 base_url 无效 '{}': {e}",
                    provider.id, provider.base_url
                ))
            })?;
        }

        if self.alternate_api.enabled {
            if let Some(problem) = self.alternate_api.problem() {
                log::warn!("[Config] 备用 API 配置不可用（{problem}），将使用直连路由");
            }
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// 单个请求看到的配置快照，创建后不可变
#[derive(Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub log_body: bool,
    pub alternate_api: AlternateApiConfig,
    pub usage_reporter: Arc<dyn UsageReporter>,
}

impl std::fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("version", &self.version)
            .field("log_body", &self.log_body)
            .field("alternate_api_enabled", &self.alternate_api.enabled)
            .finish_non_exhaustive()
    }
}

/// 读多写少的配置存储
///
/// 写操作构造新快照并整体替换，读操作只克隆 `Arc`，请求永远看不到新旧混合的配置。
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigSnapshot {
                version: 1,
                log_body: config.log_body,
                alternate_api: config.alternate_api.clone(),
                usage_reporter: Arc::new(LogUsageReporter),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 基于当前快照修改并发布新版本，返回新版本号
    pub fn update(&self, apply: impl FnOnce(&mut ConfigSnapshot)) -> u64 {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = ConfigSnapshot::clone(&guard);
        apply(&mut next);
        next.version = guard.version + 1;
        let version = next.version;
        *guard = Arc::new(next);
        version
    }

    pub fn set_log_body(&self, enabled: bool) -> u64 {
        self.update(|s| s.log_body = enabled)
    }

    pub fn set_alternate_api(&self, alternate_api: AlternateApiConfig) -> u64 {
        if alternate_api.enabled {
            if let Some(problem) = alternate_api.problem() {
                log::warn!("[Config] 备用 API 配置不可用（{problem}），请求将回退到直连路由");
            }
        }
        self.update(|s| s.alternate_api = alternate_api)
    }

    pub fn set_usage_reporter(&self, reporter: Arc<dyn UsageReporter>) -> u64 {
        self.update(|s| s.usage_reporter = reporter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::providers::Platform;
    use std::io::Write;

    const SAMPLE: &str = r#"
listen_port = 18080
log_body = true
shutdown_grace_secs = 3

[alternate_api]
enabled = true
url = "https://relay.example.com"
token = "sk-alt"

[timeouts]
connect_timeout_secs = 5
idle_read_timeout_secs = 0

[[providers]]
id = "anthropic"
platform = "claude"
base_url = "https://api.anthropic.com"
api_key = "sk-ant-1234567890"

[[providers]]
id = "openai"
platform = "openai"
base_url = "https://api.openai.com/v1"
api_key = "sk-openai"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.listen_port, 18080);
        assert!(config.log_body);
        assert!(config.alternate_api.is_complete());
        assert_eq!(config.timeouts.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.timeouts.send_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.timeouts.idle_read_timeout(), None);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].platform, Platform::OpenAiCompatible);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_duplicate_provider_ids_rejected() {
        let content = r#"
[[providers]]
id = "a"
platform = "claude"
base_url = "https://one.example.com"
api_key = "k"

[[providers]]
id = "a"
platform = "openai"
base_url = "https://two.example.com"
api_key = "k"
"#;
        let err = GatewayConfig::from_toml_str(content).unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let content = r#"
[[providers]]
id = "bad"
platform = "claude"
base_url = "not a url"
api_key = "k"
"#;
        assert!(matches!(
            GatewayConfig::from_toml_str(content),
            Err(AppError::Invalid(_))
        ));
    }

    #[test]
    fn test_incomplete_alternate_api_is_not_fatal() {
        let content = r#"
[alternate_api]
enabled = true
url = "https://relay.example.com"
"#;
        let config = GatewayConfig::from_toml_str(content).unwrap();
        assert!(!config.alternate_api.is_complete());
    }

    #[test]
    fn test_alternate_api_url_must_parse_as_http() {
        let no_scheme = AlternateApiConfig::new("relay.example.com", "sk-alt");
        assert!(!no_scheme.is_complete());
        assert!(no_scheme.problem().unwrap().contains("relay.example.com"));

        let wrong_scheme = AlternateApiConfig::new("ftp://relay.example.com", "sk-alt");
        assert!(!wrong_scheme.is_complete());

        let ok = AlternateApiConfig::new(" https://relay.example.com/ ", "sk-alt");
        assert!(ok.is_complete());
        assert!(ok.problem().is_none());

        // 不可用的备用配置不会让加载失败
        let content = r#"
[alternate_api]
enabled = true
url = "relay.example.com"
token = "sk-alt"
"#;
        let config = GatewayConfig::from_toml_str(content).unwrap();
        assert!(!config.alternate_api.is_complete());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_port, 18080);
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            GatewayConfig::load_or_default(Some(&missing)),
            Err(AppError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn test_store_snapshots_are_versioned() {
        let store = ConfigStore::new(&GatewayConfig::default());
        let before = store.snapshot();
        assert_eq!(before.version, 1);
        assert!(!before.log_body);

        let version = store.set_log_body(true);
        assert_eq!(version, 2);

        let version = store.set_alternate_api(AlternateApiConfig::new("https://alt", "tok"));
        assert_eq!(version, 3);

        // 旧快照保持不变
        assert!(!before.log_body);
        assert!(!before.alternate_api.enabled);

        let after = store.snapshot();
        assert_eq!(after.version, 3);
        assert!(after.log_body);
        assert!(after.alternate_api.is_complete());
    }
}
