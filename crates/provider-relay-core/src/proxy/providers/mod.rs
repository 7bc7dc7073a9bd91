//! Provider Profiles Module
//!
//! 上游供应商描述：平台类型、base URL、凭据与绑定的用量解析格式。
//!
//! ## 模块结构
//! - `auth`: 认证类型和策略
//! - `profile`: `Platform` 枚举与 `ProviderProfile`

mod auth;
mod profile;

pub use auth::{AuthInfo, AuthStrategy};
pub use profile::{Platform, ProviderProfile, PLATFORM_HEADER};
