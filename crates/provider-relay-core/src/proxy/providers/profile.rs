use super::auth::{AuthInfo, AuthStrategy};
use crate::proxy::usage::UsageFormat;
use serde::{Deserialize, Serialize};

/// 客户端可用此请求头显式声明平台
pub const PLATFORM_HEADER: &str = "x-relay-platform";

/// 上游平台类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "claude", alias = "anthropic")]
    Claude,
    #[serde(rename = "openai", alias = "openai-compatible", alias = "codex")]
    OpenAiCompatible,
    #[serde(rename = "gemini", alias = "google")]
    Gemini,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::OpenAiCompatible => "openai",
            Platform::Gemini => "gemini",
        }
    }

    /// 宽松解析平台名（请求头），无法识别时返回 None
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Some(Platform::Claude),
            "openai" | "openai-compatible" | "codex" => Some(Platform::OpenAiCompatible),
            "gemini" | "google" => Some(Platform::Gemini),
            _ => None,
        }
    }

    /// 按入站路径推断平台
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if path.starts_with("/v1/messages") {
            Some(Platform::Claude)
        } else if path == "/v1/chat/completions"
            || path == "/v1/completions"
            || path.starts_with("/v1/responses")
        {
            Some(Platform::OpenAiCompatible)
        } else if path.starts_with("/v1beta/") {
            Some(Platform::Gemini)
        } else {
            None
        }
    }

    pub fn usage_format(&self) -> UsageFormat {
        match self {
            Platform::Claude => UsageFormat::Claude,
            Platform::OpenAiCompatible => UsageFormat::OpenAiCompatible,
            Platform::Gemini => UsageFormat::Gemini,
        }
    }

    pub fn default_auth(&self) -> AuthStrategy {
        match self {
            Platform::Claude => AuthStrategy::Anthropic,
            Platform::OpenAiCompatible => AuthStrategy::Bearer,
            Platform::Gemini => AuthStrategy::Google,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个上游供应商，加载后不可变
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub platform: Platform,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// 覆盖平台默认的认证方式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStrategy>,
}

impl ProviderProfile {
    pub fn new(
        id: impl Into<String>,
        platform: Platform,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            platform,
            base_url: base_url.into(),
            api_key: api_key.into(),
            auth: None,
        }
    }

    pub fn auth_strategy(&self) -> AuthStrategy {
        self.auth.unwrap_or_else(|| self.platform.default_auth())
    }

    /// 未配置 key 时返回 None，请求将不带认证头转发
    pub fn auth_info(&self) -> Option<AuthInfo> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return None;
        }
        Some(AuthInfo::new(key.to_string(), self.auth_strategy()))
    }

    pub fn usage_format(&self) -> UsageFormat {
        self.platform.usage_format()
    }
}

impl std::fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth_info())
            .finish()
    }
}
