//! 请求处理器
//!
//! `/health`、`/status` 之外的所有路径都交给 `handle_relay` 透传到上游

use super::forwarder::RelayRequest;
use super::router::UpstreamRouter;
use super::server::ProxyState;
use super::types::ProxyStatus;
use super::ProxyError;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};

/// 入站请求体上限
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// 健康检查
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// 获取服务状态
pub async fn get_status(State(state): State<ProxyState>) -> Json<ProxyStatus> {
    Json(state.shared.status())
}

/// 透传入站请求
///
/// 每个请求只读取一次配置快照，之后的管理操作不影响本请求。
pub async fn handle_relay(
    State(state): State<ProxyState>,
    request: Request,
) -> Result<Response, ProxyError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let shared = &state.shared;
    shared.stats.record_request();

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| {
            let err = ProxyError::BodyRead(e.to_string());
            shared.stats.record_failure(err.to_string());
            err
        })?;

    let snapshot = shared.config.snapshot();
    let declared = UpstreamRouter::declared_platform(parts.uri.path(), &parts.headers);
    let target = shared
        .router
        .route(declared, &snapshot.alternate_api)
        .map_err(|e| {
            shared.stats.record_failure(e.to_string());
            e
        })?;

    let request = RelayRequest {
        request_id,
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    state
        .forwarder
        .forward(request, target, snapshot)
        .await
        .map_err(|e| {
            shared.stats.record_failure(e.to_string());
            e
        })
}
