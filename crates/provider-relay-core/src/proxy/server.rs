//! 代理服务器
//!
//! 生命周期：Stopped → Starting → Running → Stopping → Stopped。
//! `start` / `stop` 由同一把异步锁串行化，对已处于目标状态的服务器是空操作。

use super::forwarder::{RelayStats, RequestForwarder};
use super::handlers;
use super::router::UpstreamRouter;
use super::types::{ProxyServerInfo, ProxyStatus, ServerState};
use super::ProxyError;
use crate::collab::{MigrationRunner, NoopMigrations, UsageReporter};
use crate::config::{AlternateApiConfig, ConfigStore, GatewayConfig, TimeoutConfig};
use axum::routing::get;
use axum::Router;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// 强制关闭连接后等待服务任务退出的时间
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// 服务器与处理器共享的状态
pub(crate) struct ServerShared {
    pub config: ConfigStore,
    pub router: UpstreamRouter,
    pub stats: Arc<RelayStats>,
    state: RwLock<ServerState>,
    info: RwLock<Option<ProxyServerInfo>>,
}

impl ServerShared {
    fn state(&self) -> ServerState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ServerState) {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        log::debug!("[Server] 状态 {:?} -> {:?}", *guard, next);
        *guard = next;
    }

    fn set_info(&self, info: Option<ProxyServerInfo>) {
        let mut guard = match self.info.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = info;
    }

    pub(crate) fn status(&self) -> ProxyStatus {
        let mut status = ProxyStatus {
            state: self.state(),
            config_version: self.config.snapshot().version,
            ..ProxyStatus::default()
        };
        let info = match self.info.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(info) = info {
            status.address = info.address;
            status.port = info.port;
            status.started_at = Some(info.started_at);
        }
        self.stats.fill(&mut status);
        status
    }
}

/// axum 处理器状态
#[derive(Clone)]
pub(crate) struct ProxyState {
    pub(crate) shared: Arc<ServerShared>,
    pub(crate) forwarder: Arc<RequestForwarder>,
}

struct RunningServer {
    info: ProxyServerInfo,
    /// 停止接受新连接
    shutdown: CancellationToken,
    /// 中断仍在转发的响应流
    force_close: CancellationToken,
    join: JoinHandle<std::io::Result<()>>,
}

/// 代理服务器
pub struct ProxyServer {
    listen_address: String,
    listen_port: u16,
    timeouts: TimeoutConfig,
    shutdown_grace: Duration,
    shared: Arc<ServerShared>,
    migrations: Arc<dyn MigrationRunner>,
    running: Mutex<Option<RunningServer>>,
}

impl ProxyServer {
    pub fn new(config: GatewayConfig) -> Self {
        let shared = Arc::new(ServerShared {
            config: ConfigStore::new(&config),
            router: UpstreamRouter::new(config.providers.clone()),
            stats: Arc::new(RelayStats::default()),
            state: RwLock::new(ServerState::Stopped),
            info: RwLock::new(None),
        });
        Self {
            listen_address: config.listen_address.clone(),
            listen_port: config.listen_port,
            timeouts: config.timeouts.clone(),
            shutdown_grace: config.shutdown_grace(),
            shared,
            migrations: Arc::new(NoopMigrations),
            running: Mutex::new(None),
        }
    }

    /// 设置启动时调用的数据迁移协作者
    pub fn with_migrations(mut self, migrations: Arc<dyn MigrationRunner>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn config(&self) -> &ConfigStore {
        &self.shared.config
    }

    pub fn set_log_body(&self, enabled: bool) -> u64 {
        log::info!("[Server] 请求体日志: {}", if enabled { "开启" } else { "关闭" });
        self.shared.config.set_log_body(enabled)
    }

    pub fn set_alternate_api(&self, alternate_api: AlternateApiConfig) -> u64 {
        log::info!(
            "[Server] 备用 API: {}",
            if alternate_api.enabled { "开启" } else { "关闭" }
        );
        self.shared.config.set_alternate_api(alternate_api)
    }

    pub fn set_usage_reporter(&self, reporter: Arc<dyn UsageReporter>) -> u64 {
        self.shared.config.set_usage_reporter(reporter)
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn status(&self) -> ProxyStatus {
        self.shared.status()
    }

    /// 配置中的停机宽限期
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// 启动服务器；已运行时直接返回当前信息
    pub async fn start(&self) -> Result<ProxyServerInfo, ProxyError> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            log::debug!("[Server] 已在运行: {}", server.info.base_url());
            return Ok(server.info.clone());
        }

        self.shared.set_state(ServerState::Starting);

        // 迁移失败不阻止启动；迁移可能做同步 IO，放到阻塞线程池
        let migrations = self.migrations.clone();
        match tokio::task::spawn_blocking(move || migrations.run_migrations()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("[Server] 数据迁移失败，继续启动: {e:#}"),
            Err(e) => log::warn!("[Server] 数据迁移任务异常退出，继续启动: {e}"),
        }

        let server = match self.spawn().await {
            Ok(server) => server,
            Err(e) => {
                log::error!("[Server] 启动失败: {e}");
                self.shared.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        let info = server.info.clone();
        self.shared.set_info(Some(info.clone()));
        self.shared.set_state(ServerState::Running);
        *running = Some(server);

        log::info!(
            "[Server] 代理服务器已启动: {} ({} 个供应商)",
            info.base_url(),
            self.shared.router.len()
        );
        Ok(info)
    }

    async fn spawn(&self) -> Result<RunningServer, ProxyError> {
        let addr = format!("{}:{}", self.listen_address, self.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::BindFailed(format!("{addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| ProxyError::BindFailed(format!("{addr}: {e}")))?;

        let shutdown = CancellationToken::new();
        let force_close = CancellationToken::new();
        let forwarder = RequestForwarder::new(
            self.timeouts.clone(),
            self.shared.stats.clone(),
            force_close.clone(),
        )?;
        let app = build_router(ProxyState {
            shared: self.shared.clone(),
            forwarder: Arc::new(forwarder),
        });

        let signal = shutdown.clone();
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        Ok(RunningServer {
            info: ProxyServerInfo {
                address: local.ip().to_string(),
                port: local.port(),
                started_at: chrono::Utc::now().to_rfc3339(),
            },
            shutdown,
            force_close,
            join,
        })
    }

    /// 停止服务器
    ///
    /// 先停止接受新连接，等待进行中的响应流在宽限期内结束，超时后强制断开。
    pub async fn stop(&self, grace: Duration) -> Result<(), ProxyError> {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            log::debug!("[Server] 未运行，忽略停止请求");
            return Ok(());
        };

        self.shared.set_state(ServerState::Stopping);
        log::info!(
            "[Server] 正在停止，活跃流 {} 个，宽限期 {}s",
            self.shared.stats.active_streams(),
            grace.as_secs()
        );

        server.shutdown.cancel();
        let mut join = server.join;
        let drained = match tokio::time::timeout(grace, &mut join).await {
            Ok(result) => Some(result),
            Err(_) => {
                log::warn!(
                    "[Server] 宽限期内仍有 {} 个流未结束，强制关闭",
                    self.shared.stats.active_streams()
                );
                server.force_close.cancel();
                match tokio::time::timeout(FORCE_CLOSE_WAIT, &mut join).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        join.abort();
                        None
                    }
                }
            }
        };
        server.force_close.cancel();

        match drained {
            Some(Ok(Ok(()))) => log::info!("[Server] 代理服务器已停止"),
            Some(Ok(Err(e))) => log::warn!("[Server] 服务退出时出错: {e}"),
            Some(Err(e)) => log::warn!("[Server] 服务任务异常结束: {e}"),
            None => log::warn!("[Server] 服务任务未能按时退出，已中止"),
        }

        self.shared.set_info(None);
        self.shared.set_state(ServerState::Stopped);
        Ok(())
    }
}

pub(crate) fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::get_status))
        .fallback(handlers::handle_relay)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
