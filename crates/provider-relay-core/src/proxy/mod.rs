//! 代理服务器模块
//!
//! 提供本地 HTTP 代理服务：按平台路由到上游供应商，流式透传响应并统计 token 用量

pub mod error;
mod forwarder;
mod handlers;
pub mod providers;
pub mod router;
pub mod server;
pub mod types;
mod url_utils;
pub mod usage;

pub use error::ProxyError;
pub use providers::{AuthInfo, AuthStrategy, Platform, ProviderProfile};
pub use router::{RouteTarget, UpstreamRouter};
pub use server::ProxyServer;
pub use types::{ProxyServerInfo, ProxyStatus, ServerState};
pub use usage::{EventDemuxer, UsageCounters, UsageFormat};
