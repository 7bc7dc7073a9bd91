//! Provider路由器
//!
//! 为每个入站请求选择上游：备用 API 模式完整配置时统一转到聚合端点，
//! 否则按请求声明的平台选择对应的 ProviderProfile（未声明时默认 Claude）。

use super::providers::{AuthInfo, Platform, ProviderProfile, PLATFORM_HEADER};
use super::usage::UsageFormat;
use super::ProxyError;
use crate::config::AlternateApiConfig;
use axum::http::HeaderMap;
use std::collections::HashMap;

const ALTERNATE_PROFILE_ID: &str = "alternate-api";

/// 路由结果
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub profile: ProviderProfile,
    pub base_url: String,
    pub auth: Option<AuthInfo>,
    pub format: UsageFormat,
    pub via_alternate: bool,
}

pub struct UpstreamRouter {
    profiles: HashMap<Platform, ProviderProfile>,
}

impl UpstreamRouter {
    /// 每个平台取第一个配置的供应商
    pub fn new(profiles: Vec<ProviderProfile>) -> Self {
        let mut map: HashMap<Platform, ProviderProfile> = HashMap::new();
        for profile in profiles {
            if let Some(existing) = map.get(&profile.platform) {
                log::warn!(
                    "[Router] 平台 {} 已绑定 {}，忽略 {}",
                    profile.platform,
                    existing.id,
                    profile.id
                );
                continue;
            }
            map.insert(profile.platform, profile);
        }
        Self { profiles: map }
    }

    pub fn profile(&self, platform: Platform) -> Option<&ProviderProfile> {
        self.profiles.get(&platform)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// 从请求头或路径推断平台；请求头优先
    pub fn declared_platform(path: &str, headers: &HeaderMap) -> Option<Platform> {
        if let Some(value) = headers.get(PLATFORM_HEADER).and_then(|v| v.to_str().ok()) {
            match Platform::parse(value) {
                Some(platform) => return Some(platform),
                None => log::warn!("[Router] 无法识别的 {PLATFORM_HEADER}: {value}"),
            }
        }
        Platform::from_path(path)
    }

    /// 选择上游
    pub fn route(
        &self,
        declared: Option<Platform>,
        alternate: &AlternateApiConfig,
    ) -> Result<RouteTarget, ProxyError> {
        let platform = declared.unwrap_or_else(|| {
            log::debug!("[Router] 请求未声明平台，使用默认 claude");
            Platform::Claude
        });

        if alternate.enabled {
            match alternate.problem() {
                None => return Ok(Self::alternate_target(platform, alternate)),
                Some(problem) => {
                    log::warn!("[Router] 备用 API 配置不可用（{problem}），回退到直连路由")
                }
            }
        }

        let profile = self.profiles.get(&platform).ok_or_else(|| {
            log::warn!("[Router] 平台 {platform} 没有配置供应商");
            ProxyError::NoAvailableProvider(platform.to_string())
        })?;

        Ok(RouteTarget {
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            auth: profile.auth_info(),
            format: profile.usage_format(),
            profile: profile.clone(),
            via_alternate: false,
        })
    }

    fn alternate_target(platform: Platform, alternate: &AlternateApiConfig) -> RouteTarget {
        let profile = ProviderProfile::new(
            ALTERNATE_PROFILE_ID,
            platform,
            alternate.url.trim(),
            alternate.token.trim(),
        );
        RouteTarget {
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            auth: profile.auth_info(),
            format: platform.usage_format(),
            profile,
            via_alternate: true,
        }
    }
}
