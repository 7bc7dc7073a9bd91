//! Response Parser - 从上游事件载荷中提取 token 使用量
//!
//! 支持的格式：
//! - Claude (`message.usage` 与顶层 `usage`)
//! - OpenAI 兼容 (Responses API、Chat Completions、通用 input/output 形式)
//! - Gemini (`usageMetadata`)
//!
//! 同一载荷可能同时匹配多条路径，每条命中的路径都会累加到计数器上。
//! 解析失败或缺少字段时贡献为 0，从不报错。

use super::counters::UsageCounters;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 用量解析格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageFormat {
    Claude,
    OpenAiCompatible,
    Gemini,
}

impl UsageFormat {
    /// 解析一条事件载荷（JSON 文本）并累加用量
    pub fn extract_usage(&self, payload: &str, counters: &mut UsageCounters) {
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        self.extract_from_value(&value, counters);
    }

    pub fn extract_from_value(&self, value: &Value, counters: &mut UsageCounters) {
        match self {
            UsageFormat::Claude => extract_claude(value, counters),
            UsageFormat::OpenAiCompatible => extract_openai(value, counters),
            UsageFormat::Gemini => extract_gemini(value, counters),
        }
    }
}

fn uint(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn nested_uint(value: &Value, object: &str, key: &str) -> u64 {
    value.get(object).map(|v| uint(v, key)).unwrap_or(0)
}

fn extract_claude(event: &Value, counters: &mut UsageCounters) {
    // message_start 把 usage 放在 message 里，message_delta 放在顶层
    let message_usage = event.get("message").and_then(|m| m.get("usage"));
    let top_usage = event.get("usage");

    for usage in [message_usage, top_usage].into_iter().flatten() {
        if !usage.is_object() {
            continue;
        }
        counters.add_input(uint(usage, "input_tokens"));
        counters.add_output(uint(usage, "output_tokens"));
        counters.add_cache_create(uint(usage, "cache_creation_input_tokens"));
        counters.add_cache_read(uint(usage, "cache_read_input_tokens"));
    }
}

fn extract_openai(event: &Value, counters: &mut UsageCounters) {
    // Responses API: response.completed 事件
    if let Some(usage) = event.get("response").and_then(|r| r.get("usage")) {
        add_input_output_shape(usage, counters);
    }

    let Some(usage) = event.get("usage").filter(|u| u.is_object()) else {
        return;
    };

    // Chat Completions
    counters.add_input(uint(usage, "prompt_tokens"));
    counters.add_output(uint(usage, "completion_tokens"));
    counters.add_cache_read(nested_uint(usage, "prompt_tokens_details", "cached_tokens"));
    counters.add_reasoning(nested_uint(
        usage,
        "completion_tokens_details",
        "reasoning_tokens",
    ));

    // 通用 input/output 形式（非流式 Responses、各类兼容网关）
    add_input_output_shape(usage, counters);
}

fn add_input_output_shape(usage: &Value, counters: &mut UsageCounters) {
    counters.add_input(uint(usage, "input_tokens"));
    counters.add_output(uint(usage, "output_tokens"));
    counters.add_cache_read(nested_uint(usage, "input_tokens_details", "cached_tokens"));
    counters.add_reasoning(nested_uint(usage, "output_tokens_details", "reasoning_tokens"));
}

fn extract_gemini(chunk: &Value, counters: &mut UsageCounters) {
    let Some(usage) = chunk.get("usageMetadata") else {
        return;
    };

    // 流式分块里的 usageMetadata 是累计值，只在带 finishReason 的终结块上计数
    if let Some(candidates) = chunk.get("candidates").and_then(Value::as_array) {
        let finished = candidates
            .iter()
            .any(|c| c.get("finishReason").is_some_and(|r| !r.is_null()));
        if !finished {
            return;
        }
    }

    counters.add_input(uint(usage, "promptTokenCount"));
    counters.add_output(uint(usage, "candidatesTokenCount"));
    counters.add_cache_read(uint(usage, "cachedContentTokenCount"));
    counters.add_reasoning(uint(usage, "thoughtsTokenCount"));
}
