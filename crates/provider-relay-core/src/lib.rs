//! Provider Relay Gateway 核心库
//!
//! 本地 HTTP 网关：接收 Claude / OpenAI 兼容 / Gemini 格式的请求，透传到上游供应商，
//! 在流式转发响应的同时解析 SSE 事件中的 token 用量，并交给用量上报协作者。

pub mod collab;
pub mod config;
pub mod error;
pub mod proxy;

pub use collab::{
    ChannelUsageReporter, LogUsageReporter, MigrationRunner, NoopMigrations, UsageReport,
    UsageReporter,
};
pub use config::{AlternateApiConfig, ConfigSnapshot, ConfigStore, GatewayConfig, TimeoutConfig};
pub use error::AppError;
pub use proxy::{
    AuthStrategy, Platform, ProviderProfile, ProxyError, ProxyServer, ProxyServerInfo,
    ProxyStatus, ServerState, UsageCounters, UsageFormat,
};
