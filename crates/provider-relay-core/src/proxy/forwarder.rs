//! 请求转发器
//!
//! 把入站请求原样转发到路由选出的上游，再把上游响应逐块透传给客户端。
//! 每个分块先交给用量观测（解析其中完整的 SSE 数据行），再交给客户端，
//! 因此用量统计永远不会领先于客户端已收到的内容。

use super::providers::PLATFORM_HEADER;
use super::router::RouteTarget;
use super::types::ProxyStatus;
use super::url_utils::{build_upstream_url, mask_url};
use super::usage::tap::{UsageGuard, UsageTap};
use super::ProxyError;
use crate::config::{ConfigSnapshot, TimeoutConfig};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub(crate) const REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// 不透传到上游的请求头（认证头由 Provider 配置重新注入）
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "accept-encoding",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
    PLATFORM_HEADER,
];

/// 不回传给客户端的响应头
const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "content-length",
    "trailer",
    "upgrade",
];

/// 响应体日志最多保留的字节数
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// 请求计数，流结束时（包括 Drop）也需要同步更新，所以用原子量
#[derive(Debug, Default)]
pub(crate) struct RelayStats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    active_streams: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RelayStats {
    pub(crate) fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, message: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut last = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(message.into());
    }

    fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub(crate) fn fill(&self, status: &mut ProxyStatus) {
        status.total_requests = self.total.load(Ordering::Relaxed);
        status.success_requests = self.success.load(Ordering::Relaxed);
        status.failed_requests = self.failed.load(Ordering::Relaxed);
        status.active_streams = self.active_streams();
        status.last_error = match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
    }
}

/// 一次入站请求
pub(crate) struct RelayRequest {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub(crate) struct RequestForwarder {
    client: Client,
    timeouts: TimeoutConfig,
    stats: Arc<RelayStats>,
    force_close: CancellationToken,
}

impl RequestForwarder {
    pub(crate) fn new(
        timeouts: TimeoutConfig,
        stats: Arc<RelayStats>,
        force_close: CancellationToken,
    ) -> Result<Self, ProxyError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60));
        if let Some(connect) = timeouts.connect_timeout() {
            builder = builder.connect_timeout(connect);
        }
        let client = builder
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeouts,
            stats,
            force_close,
        })
    }

    /// 转发请求并返回透传响应
    ///
    /// 连接失败、超时返回 `Err`；上游非 2xx 响应原样透传且不上报用量。
    pub(crate) async fn forward(
        &self,
        request: RelayRequest,
        target: RouteTarget,
        snapshot: Arc<ConfigSnapshot>,
    ) -> Result<Response, ProxyError> {
        let RelayRequest {
            request_id,
            method,
            path,
            query,
            headers,
            body,
        } = request;

        let url = build_upstream_url(&target.base_url, &path, query.as_deref());
        log::info!(
            "[Relay] {request_id} {method} {path} -> {} ({}{})",
            mask_url(&url),
            target.profile.id,
            if target.via_alternate { ", alternate" } else { "" }
        );
        if snapshot.log_body {
            log::info!(
                "[Relay] {request_id} request body: {}",
                String::from_utf8_lossy(&body)
            );
        }

        let is_head = method == Method::HEAD;
        let mut builder = self.client.request(method, &url);
        for (key, value) in headers.iter() {
            if SKIPPED_REQUEST_HEADERS.contains(&key.as_str()) {
                continue;
            }
            builder = builder.header(key, value);
        }
        match &target.auth {
            Some(auth) => {
                log::debug!(
                    "[Relay] {request_id} auth {:?} key {}",
                    auth.strategy,
                    auth.masked_key()
                );
                builder = auth.apply(builder, headers.contains_key("anthropic-version"));
            }
            None => log::warn!(
                "[Relay] {request_id} 供应商 {} 未配置 API Key，将发送未认证的请求",
                target.profile.id
            ),
        }
        let builder = builder.body(body);

        let started = Instant::now();
        let send_timeout = self.timeouts.send_timeout();
        let send = async move {
            match send_timeout {
                Some(limit) => tokio::time::timeout(limit, builder.send())
                    .await
                    .map_err(|_| {
                        ProxyError::Timeout(format!("上游 {}s 内未返回响应头", limit.as_secs()))
                    })?
                    .map_err(ProxyError::from_reqwest),
                None => builder.send().await.map_err(ProxyError::from_reqwest),
            }
        };
        let response = tokio::select! {
            biased;
            _ = self.force_close.cancelled() => {
                Err(ProxyError::ForwardFailed("服务器正在关闭".to_string()))
            }
            sent = send => sent,
        }
        .map_err(|e| {
            log::error!("[Relay] {request_id} Request Failed: {e}");
            e
        })?;

        let status = response.status();
        log::debug!(
            "[Relay] {request_id} upstream status {} after {}ms",
            status.as_u16(),
            started.elapsed().as_millis()
        );

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        let mut builder = Response::builder().status(status);
        for (key, value) in response.headers() {
            if SKIPPED_RESPONSE_HEADERS.contains(&key.as_str()) {
                continue;
            }
            builder = builder.header(key, value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            builder = builder.header(REQUEST_ID_HEADER, value);
        }

        let observer = if status.is_success() {
            RelayObserver::new(
                request_id.clone(),
                Some((
                    UsageTap::new(target.format, is_sse),
                    UsageGuard::new(request_id, snapshot.usage_reporter.clone()),
                )),
                snapshot.log_body,
                self.stats.clone(),
            )
        } else {
            log::warn!(
                "[Relay] {request_id} 上游返回 {}，原样透传",
                status.as_u16()
            );
            RelayObserver::new(request_id, None, snapshot.log_body, self.stats.clone())
        };
        // HEAD、204、304 没有响应体，hyper 可能根本不轮询该流
        let observer = observer.with_empty_body(
            is_head
                || status == reqwest::StatusCode::NO_CONTENT
                || status == reqwest::StatusCode::NOT_MODIFIED,
        );

        let body = relay_body(
            response,
            observer,
            self.timeouts.idle_read_timeout(),
            self.force_close.clone(),
        );
        builder
            .body(body)
            .map_err(|e| ProxyError::Internal(format!("Failed to build response: {e}")))
    }
}

/// 流的结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamOutcome {
    Completed,
    Truncated(String),
    ClientGone,
}

/// 观察透传字节：用量统计、请求体日志、计数
struct RelayObserver {
    request_id: String,
    usage: Option<(UsageTap, UsageGuard)>,
    capture: Option<Vec<u8>>,
    capture_truncated: bool,
    empty_body: bool,
    stats: Arc<RelayStats>,
    bytes: u64,
    started: Instant,
    outcome: Option<StreamOutcome>,
}

impl RelayObserver {
    fn new(
        request_id: String,
        usage: Option<(UsageTap, UsageGuard)>,
        log_body: bool,
        stats: Arc<RelayStats>,
    ) -> Self {
        stats.stream_opened();
        Self {
            request_id,
            usage,
            capture: log_body.then(Vec::new),
            capture_truncated: false,
            empty_body: false,
            stats,
            bytes: 0,
            started: Instant::now(),
            outcome: None,
        }
    }

    fn with_empty_body(mut self, empty_body: bool) -> Self {
        self.empty_body = empty_body;
        self
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        if let Some((tap, guard)) = self.usage.as_mut() {
            tap.observe(chunk, guard.counters_mut());
        }
        if let Some(capture) = self.capture.as_mut() {
            let room = MAX_CAPTURE_BYTES.saturating_sub(capture.len());
            if chunk.len() > room {
                self.capture_truncated = true;
            }
            capture.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if self.outcome.is_some() {
            return;
        }
        let elapsed = self.started.elapsed().as_millis();

        if let Some((tap, guard)) = self.usage.as_mut() {
            // 只有正常结束时才处理最后一行（未以换行结尾）或整体 JSON
            if outcome == StreamOutcome::Completed {
                tap.finish(guard.counters_mut());
            }
            let usage = guard.counters();
            log::debug!(
                "[Usage] {} input={} output={} cache_create={} cache_read={} reasoning={}",
                self.request_id,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_create_tokens,
                usage.cache_read_tokens,
                usage.reasoning_tokens
            );
            guard.report();
        }

        if let Some(capture) = self.capture.take() {
            log::info!(
                "[Relay] {} response body ({} bytes{}): {}",
                self.request_id,
                self.bytes,
                if self.capture_truncated {
                    format!(", 仅记录前 {MAX_CAPTURE_BYTES} 字节")
                } else {
                    String::new()
                },
                String::from_utf8_lossy(&capture)
            );
        }

        match &outcome {
            StreamOutcome::Completed if self.usage.is_some() => {
                self.stats.record_success();
                log::info!(
                    "[Relay] {} completed: {} bytes in {elapsed}ms",
                    self.request_id,
                    self.bytes
                );
            }
            StreamOutcome::Completed => {
                self.stats.record_failure(format!("{} 上游返回错误状态", self.request_id));
            }
            StreamOutcome::Truncated(reason) => {
                log::warn!(
                    "[Relay] {} 流被截断（已转发 {} bytes, {elapsed}ms）: {reason}",
                    self.request_id,
                    self.bytes
                );
                self.stats
                    .record_failure(format!("{} 流被截断: {reason}", self.request_id));
            }
            StreamOutcome::ClientGone => {
                log::warn!(
                    "[Relay] {} 客户端已断开（已转发 {} bytes），取消上游读取",
                    self.request_id,
                    self.bytes
                );
                self.stats
                    .record_failure(format!("{} 客户端断开", self.request_id));
            }
        }
        self.outcome = Some(outcome);
    }
}

impl Drop for RelayObserver {
    fn drop(&mut self) {
        // 流在结束前被丢弃：下游断开或服务器强制关闭连接
        if self.outcome.is_none() {
            if self.empty_body && self.bytes == 0 {
                self.finish(StreamOutcome::Completed);
            } else {
                self.finish(StreamOutcome::ClientGone);
            }
        }
        self.stats.stream_closed();
    }
}

enum ReadError {
    Upstream(reqwest::Error),
    Idle(Duration),
}

async fn next_chunk<S>(
    upstream: &mut S,
    idle: Option<Duration>,
) -> Result<Option<Bytes>, ReadError>
where
    S: futures::Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let next = match idle {
        Some(limit) => tokio::time::timeout(limit, upstream.next())
            .await
            .map_err(|_| ReadError::Idle(limit))?,
        None => upstream.next().await,
    };
    next.transpose().map_err(ReadError::Upstream)
}

/// 透传响应体
///
/// 客户端断开时 axum 丢弃该流，上游读取随之取消，`RelayObserver` 在 Drop 中上报已累计用量。
fn relay_body(
    response: reqwest::Response,
    mut observer: RelayObserver,
    idle: Option<Duration>,
    force_close: CancellationToken,
) -> Body {
    let stream = async_stream::stream! {
        let mut upstream = Box::pin(response.bytes_stream());
        loop {
            let next = tokio::select! {
                biased;
                _ = force_close.cancelled() => Err(None),
                read = next_chunk(&mut upstream, idle) => read.map_err(Some),
            };

            match next {
                Ok(Some(chunk)) => {
                    observer.observe(&chunk);
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Ok(None) => {
                    observer.finish(StreamOutcome::Completed);
                    break;
                }
                Err(reason) => {
                    let message = match reason {
                        Some(ReadError::Upstream(e)) => format!("上游连接中断: {e}"),
                        Some(ReadError::Idle(limit)) => {
                            format!("上游 {}s 无数据", limit.as_secs())
                        }
                        None => "服务器关闭，强制断开".to_string(),
                    };
                    observer.finish(StreamOutcome::Truncated(message.clone()));
                    yield Err(std::io::Error::other(message));
                    break;
                }
            }
        }
    };
    Body::from_stream(stream)
}
