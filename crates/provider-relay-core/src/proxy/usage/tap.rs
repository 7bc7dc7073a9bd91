//! 每请求的用量观测
//!
//! `UsageTap` 只读地观察转发给客户端的字节；`UsageGuard` 独占该请求的计数器，
//! 并保证向协作者恰好上报一次（正常结束、中途截断或下游断开时 Drop 兜底）。

use super::counters::UsageCounters;
use super::demux::EventDemuxer;
use super::parser::UsageFormat;
use crate::collab::UsageReporter;
use std::sync::Arc;

/// 非流式 JSON 响应最多缓存的字节数
const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

pub(crate) enum UsageTap {
    /// text/event-stream：逐行拆分
    Sse(EventDemuxer),
    /// 普通 JSON 响应：结束时整体解析一次
    Document {
        format: UsageFormat,
        buffer: Vec<u8>,
        overflowed: bool,
    },
}

impl UsageTap {
    pub(crate) fn new(format: UsageFormat, is_sse: bool) -> Self {
        if is_sse {
            Self::Sse(EventDemuxer::new(format))
        } else {
            Self::Document {
                format,
                buffer: Vec::new(),
                overflowed: false,
            }
        }
    }

    pub(crate) fn observe(&mut self, chunk: &[u8], counters: &mut UsageCounters) {
        match self {
            Self::Sse(demux) => demux.feed(chunk, counters),
            Self::Document {
                buffer, overflowed, ..
            } => {
                if *overflowed {
                    return;
                }
                if buffer.len() + chunk.len() > MAX_DOCUMENT_BYTES {
                    log::debug!("[Usage] 响应体超过 {MAX_DOCUMENT_BYTES} 字节，跳过用量解析");
                    *overflowed = true;
                    buffer.clear();
                    return;
                }
                buffer.extend_from_slice(chunk);
            }
        }
    }

    pub(crate) fn finish(&mut self, counters: &mut UsageCounters) {
        match self {
            Self::Sse(demux) => demux.finish(counters),
            Self::Document {
                format,
                buffer,
                overflowed,
            } => {
                if !*overflowed && !buffer.is_empty() {
                    if let Ok(value) =
                        serde_json::from_slice::<serde_json::Value>(buffer.as_slice())
                    {
                        format.extract_from_value(&value, counters);
                    }
                }
                buffer.clear();
            }
        }
    }
}

pub(crate) struct UsageGuard {
    request_id: String,
    counters: UsageCounters,
    reporter: Arc<dyn UsageReporter>,
    reported: bool,
}

impl UsageGuard {
    pub(crate) fn new(request_id: String, reporter: Arc<dyn UsageReporter>) -> Self {
        Self {
            request_id,
            counters: UsageCounters::default(),
            reporter,
            reported: false,
        }
    }

    pub(crate) fn counters_mut(&mut self) -> &mut UsageCounters {
        &mut self.counters
    }

    pub(crate) fn counters(&self) -> &UsageCounters {
        &self.counters
    }

    /// 上报；重复调用无效
    pub(crate) fn report(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;
        self.reporter.report_usage(&self.request_id, &self.counters);
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if !self.reported {
            log::warn!(
                "[Usage] {} 在流结束前被丢弃（下游断开或强制关闭），上报已累计用量",
                self.request_id
            );
            self.report();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ChannelUsageReporter;

    #[test]
    fn test_document_tap_parses_once_at_finish() {
        let mut usage = UsageCounters::default();
        let mut tap = UsageTap::new(UsageFormat::Claude, false);
        let body = br#"{"id":"msg_1","usage":{"input_tokens":100,"output_tokens":50}}"#;
        for chunk in body.chunks(10) {
            tap.observe(chunk, &mut usage);
        }
        assert!(usage.is_empty());
        tap.finish(&mut usage);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
    }

    #[test]
    fn test_guard_reports_exactly_once() {
        let (reporter, mut rx) = ChannelUsageReporter::new();
        let mut guard = UsageGuard::new("req-a".to_string(), Arc::new(reporter));
        guard.counters_mut().add_output(3);
        guard.report();
        guard.report();
        drop(guard);

        let report = rx.try_recv().unwrap();
        assert_eq!(report.usage.output_tokens, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_guard_reports_partial_usage_on_drop() {
        let (reporter, mut rx) = ChannelUsageReporter::new();
        let mut guard = UsageGuard::new("req-b".to_string(), Arc::new(reporter));
        guard.counters_mut().add_input(11);
        drop(guard);

        let report = rx.try_recv().unwrap();
        assert_eq!(report.request_id, "req-b");
        assert_eq!(report.usage.input_tokens, 11);
        assert!(rx.try_recv().is_err());
    }
}
