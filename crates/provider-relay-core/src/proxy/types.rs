use serde::{Deserialize, Serialize};

/// 服务器生命周期：Stopped → Starting → Running → Stopping → Stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// 代理服务器信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServerInfo {
    pub address: String,
    pub port: u16,
    pub started_at: String,
}

impl ProxyServerInfo {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// 代理服务状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub state: ServerState,
    pub address: String,
    pub port: u16,
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    /// 正在转发中的响应流
    pub active_streams: u64,
    pub last_error: Option<String>,
    pub config_version: u64,
    pub started_at: Option<String>,
}
