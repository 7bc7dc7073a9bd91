//! 代理错误类型
//!
//! 只有路由错误和上游连接错误会返回给客户端；上游的非 2xx 响应原样透传，不经过这里。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("没有可用的上游供应商: {0}")]
    NoAvailableProvider(String),

    #[error("转发失败: {0}")]
    ForwardFailed(String),

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("读取请求体失败: {0}")]
    BodyRead(String),

    #[error("端口绑定失败: {0}")]
    BindFailed(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoAvailableProvider(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ForwardFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BodyRead(_) => StatusCode::BAD_REQUEST,
            ProxyError::BindFailed(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProxyError::ForwardFailed(format!("连接失败: {err}"))
        } else {
            ProxyError::ForwardFailed(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        log::error!("[Relay] 返回网关错误 {}: {}", status.as_u16(), self);
        let body = json!({
            "error": {
                "type": "proxy_error",
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::NoAvailableProvider("gemini".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::ForwardFailed("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Timeout("slow".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::BodyRead("eof".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_into_response_uses_status() {
        let response = ProxyError::ForwardFailed("refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
