#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use provider_relay_core::{ChannelUsageReporter, GatewayConfig, ProxyServer, UsageReport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

/// 控制 mock 上游行为的请求头
pub const SCENARIO_HEADER: &str = "x-mock-scenario";

pub const CLAUDE_CHUNKS: &[&str] = &[
    "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hel",
    "lo\"}}\n\nevent: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n\n",
    "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
];

pub const OPENAI_CHUNKS: &[&str] = &[
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3,",
    "\"completion_tokens_details\":{\"reasoning_tokens\":2}}}\n\ndata: [DONE]\n\n",
];

/// `slow-headers` 场景下响应头的延迟
pub const SLOW_HEADERS_DELAY: Duration = Duration::from_secs(3);

pub const ERROR_BODY: &str = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#;

pub const JSON_BODY: &str =
    r#"{"id":"msg_1","content":[],"usage":{"input_tokens":12,"output_tokens":4,"cache_read_input_tokens":3}}"#;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 本地 mock 上游
pub struct MockUpstream {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();
        let recorded = requests.clone();
        let app = axum::Router::new().fallback(
            move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
                let recorded = recorded.clone();
                async move {
                    let scenario = headers
                        .get(SCENARIO_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    recorded.lock().unwrap().push(RecordedRequest {
                        method,
                        path: uri.path().to_string(),
                        query: uri.query().map(str::to_string),
                        headers,
                        body,
                    });
                    if scenario == "slow-headers" {
                        tokio::time::sleep(SLOW_HEADERS_DELAY).await;
                    }
                    respond(&scenario, uri.path())
                }
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// 事件发完之后上游的行为
#[derive(Clone, Copy, PartialEq)]
enum Tail {
    End,
    /// 只发送 SSE 注释保活
    Ping,
    /// 连接保持打开但不再发送任何字节
    Silent,
}

fn sse_response(chunks: Vec<Result<Bytes, std::io::Error>>, tail: Tail) -> Response {
    let stream = async_stream::stream! {
        for chunk in chunks {
            yield chunk;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        while tail == Tail::Ping {
            tokio::time::sleep(Duration::from_millis(50)).await;
            yield Ok(Bytes::from_static(b": ping\n\n"));
        }
        if tail == Tail::Silent {
            futures::future::pending::<()>().await;
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("x-upstream-id", "mock-1")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn ok_chunks(chunks: &[&str]) -> Vec<Result<Bytes, std::io::Error>> {
    chunks
        .iter()
        .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
        .collect()
}

fn respond(scenario: &str, path: &str) -> Response {
    match scenario {
        "error" => Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .body(Body::from(ERROR_BODY))
            .unwrap(),
        "json" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(JSON_BODY))
            .unwrap(),
        // 第一个事件之后连接中断
        "truncate" => {
            let mut chunks = ok_chunks(&CLAUDE_CHUNKS[..1]);
            chunks.push(Err(std::io::Error::other("upstream reset")));
            sse_response(chunks, Tail::End)
        }
        // 第一个事件之后只有保活注释
        "stall" => sse_response(ok_chunks(&CLAUDE_CHUNKS[..1]), Tail::Ping),
        // 第一个事件之后上游静默
        "silent" => sse_response(ok_chunks(&CLAUDE_CHUNKS[..1]), Tail::Silent),
        _ if path.starts_with("/v1/chat/completions") => {
            sse_response(ok_chunks(OPENAI_CHUNKS), Tail::End)
        }
        _ => sse_response(ok_chunks(CLAUDE_CHUNKS), Tail::End),
    }
}

/// 一个已经关闭的本地端口
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// 启动网关，返回服务器、基础地址与用量接收端
pub async fn start_gateway(
    config: GatewayConfig,
) -> (ProxyServer, String, UnboundedReceiver<UsageReport>) {
    let server = ProxyServer::new(GatewayConfig {
        listen_port: 0,
        ..config
    });
    let (reporter, rx) = ChannelUsageReporter::new();
    server.set_usage_reporter(Arc::new(reporter));
    let info = server.start().await.unwrap();
    (server, info.base_url(), rx)
}

/// 等待下一条用量记录
pub async fn next_report(rx: &mut UnboundedReceiver<UsageReport>) -> UsageReport {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("usage report not delivered in time")
        .expect("reporter channel closed")
}

/// 确认没有（更多）用量记录
pub async fn assert_no_report(rx: &mut UnboundedReceiver<UsageReport>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(
        !matches!(extra, Ok(Some(_))),
        "unexpected usage report: {extra:?}"
    );
}

pub fn concat(chunks: &[&str]) -> String {
    chunks.concat()
}
