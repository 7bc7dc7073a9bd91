//! SSE 事件拆分
//!
//! 按换行切分原始响应体，去掉首尾空白后，以 `data:` 开头的行视为一条事件载荷，
//! 按到达顺序交给绑定的解析器。其余行（`event:`、`id:`、注释、空行）忽略。

use super::counters::UsageCounters;
use super::parser::UsageFormat;

pub const DATA_PREFIX: &str = "data:";

/// 单行上限，超出的行整体丢弃
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// 若该行是数据行，返回去掉前缀后的载荷
pub fn data_payload(line: &str) -> Option<&str> {
    line.trim().strip_prefix(DATA_PREFIX).map(str::trim)
}

/// 对完整文本做惰性拆分
pub fn data_payloads(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter_map(data_payload)
}

/// 增量拆分器：跨分块只缓存当前未结束的一行
#[derive(Debug)]
pub struct EventDemuxer {
    format: UsageFormat,
    line: Vec<u8>,
    overflowed: bool,
    frames: u64,
}

impl EventDemuxer {
    pub fn new(format: UsageFormat) -> Self {
        Self {
            format,
            line: Vec::new(),
            overflowed: false,
            frames: 0,
        }
    }

    pub fn format(&self) -> UsageFormat {
        self.format
    }

    /// 已交给解析器的数据帧数
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// 喂入一个分块；其中每一条完整的数据行都会在返回前解析完毕
    pub fn feed(&mut self, chunk: &[u8], counters: &mut UsageCounters) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.push(&rest[..pos]);
            self.dispatch_line(counters);
            rest = &rest[pos + 1..];
        }
        self.push(rest);
    }

    /// 流结束：处理没有换行结尾的最后一行
    pub fn finish(&mut self, counters: &mut UsageCounters) {
        if !self.line.is_empty() || self.overflowed {
            self.dispatch_line(counters);
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.line.len() + bytes.len() > MAX_LINE_BYTES {
            log::warn!("[Usage] SSE 行超过 {MAX_LINE_BYTES} 字节，跳过解析");
            self.line.clear();
            self.overflowed = true;
            return;
        }
        self.line.extend_from_slice(bytes);
    }

    fn dispatch_line(&mut self, counters: &mut UsageCounters) {
        if self.overflowed {
            self.overflowed = false;
            self.line.clear();
            return;
        }

        let matched = {
            let line = String::from_utf8_lossy(&self.line);
            match data_payload(&line) {
                Some(payload) => {
                    self.format.extract_usage(payload, counters);
                    true
                }
                None => false,
            }
        };
        if matched {
            self.frames += 1;
        }
        self.line.clear();
    }
}
