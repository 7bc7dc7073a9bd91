//! Proxy Usage Tracking Module
//!
//! 从上游响应中提取 token 用量：计数器、各平台解析器、SSE 事件拆分与每请求的观测管道

pub mod counters;
pub mod demux;
pub mod parser;
pub(crate) mod tap;

pub use counters::UsageCounters;
pub use demux::{data_payloads, EventDemuxer, DATA_PREFIX};
pub use parser::UsageFormat;
