//! Authentication Types
//!
//! 定义认证信息和认证策略，支持多种上游供应商的认证方式。

use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// 认证信息
///
/// 包含 API Key 和对应的认证策略
#[derive(Clone)]
pub struct AuthInfo {
    /// API Key
    pub api_key: String,
    /// 认证策略
    pub strategy: AuthStrategy,
}

impl AuthInfo {
    /// 创建新的认证信息
    pub fn new(api_key: String, strategy: AuthStrategy) -> Self {
        Self { api_key, strategy }
    }

    /// 返回遮蔽后的 API Key（用于日志输出）
    ///
    /// 显示前4位和后4位，中间用 `...` 代替
    /// 如果 key 长度不足8位，则返回 `***`
    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "***".to_string()
        }
    }

    /// 按策略注入认证头
    ///
    /// `caller_sent_version` 为 true 时保留客户端自己的 `anthropic-version`
    pub fn apply(&self, request: RequestBuilder, caller_sent_version: bool) -> RequestBuilder {
        match self.strategy {
            AuthStrategy::Anthropic => {
                let request = request.header("x-api-key", &self.api_key);
                if caller_sent_version {
                    request
                } else {
                    request.header("anthropic-version", ANTHROPIC_VERSION)
                }
            }
            AuthStrategy::Bearer => {
                request.header("Authorization", format!("Bearer {}", self.api_key))
            }
            AuthStrategy::Google => request.header("x-goog-api-key", &self.api_key),
        }
    }
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("api_key", &self.masked_key())
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// 认证策略
///
/// 不同供应商使用不同的认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategy {
    /// Anthropic 认证方式
    /// - Header: `x-api-key: <api_key>`
    /// - Header: `anthropic-version: 2023-06-01`
    Anthropic,

    /// Bearer Token 认证方式（OpenAI 等）
    /// - Header: `Authorization: Bearer <api_key>`
    Bearer,

    /// Google 认证方式
    /// - Header: `x-goog-api-key: <api_key>`
    Google,
}
