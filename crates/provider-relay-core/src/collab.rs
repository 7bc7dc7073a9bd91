//! 外部协作者接口
//!
//! - `UsageReporter`: 每个请求结束（正常完成或中途截断）时恰好调用一次，
//!   由多端同步子系统负责持久化与分发
//! - `MigrationRunner`: 启动时调用一次，失败只记录警告，不阻止网关启动

use crate::proxy::UsageCounters;
use tokio::sync::mpsc;

/// 用量上报协作者（fire-and-forget）
pub trait UsageReporter: Send + Sync {
    fn report_usage(&self, request_id: &str, usage: &UsageCounters);
}

/// 数据迁移协作者
pub trait MigrationRunner: Send + Sync {
    fn run_migrations(&self) -> anyhow::Result<()>;
}

/// 默认上报器：仅写日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUsageReporter;

impl UsageReporter for LogUsageReporter {
    fn report_usage(&self, request_id: &str, usage: &UsageCounters) {
        log::info!(
            "[Usage] {request_id}: input={} output={} cache_create={} cache_read={} reasoning={}",
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_create_tokens,
            usage.cache_read_tokens,
            usage.reasoning_tokens
        );
    }
}

/// 一条上报记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub request_id: String,
    pub usage: UsageCounters,
}

/// 通过 mpsc 通道把用量交给同步子系统
#[derive(Debug, Clone)]
pub struct ChannelUsageReporter {
    tx: mpsc::UnboundedSender<UsageReport>,
}

impl ChannelUsageReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UsageReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UsageReporter for ChannelUsageReporter {
    fn report_usage(&self, request_id: &str, usage: &UsageCounters) {
        let report = UsageReport {
            request_id: request_id.to_string(),
            usage: usage.clone(),
        };
        if self.tx.send(report).is_err() {
            log::warn!("[Usage] 接收端已关闭，丢弃用量记录: {request_id}");
        }
    }
}

/// 无需迁移时使用
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMigrations;

impl MigrationRunner for NoopMigrations {
    fn run_migrations(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
