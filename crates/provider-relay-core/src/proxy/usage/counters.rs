use serde::{Deserialize, Serialize};

/// 单个请求的 Token 用量累加器
///
/// 解析器只做加法，字段在请求生命周期内单调不减。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
    pub reasoning_tokens: u64,
}

impl UsageCounters {
    pub fn add_input(&mut self, n: u64) {
        self.input_tokens = self.input_tokens.saturating_add(n);
    }

    pub fn add_output(&mut self, n: u64) {
        self.output_tokens = self.output_tokens.saturating_add(n);
    }

    pub fn add_cache_create(&mut self, n: u64) {
        self.cache_create_tokens = self.cache_create_tokens.saturating_add(n);
    }

    pub fn add_cache_read(&mut self, n: u64) {
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(n);
    }

    pub fn add_reasoning(&mut self, n: u64) {
        self.reasoning_tokens = self.reasoning_tokens.saturating_add(n);
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 每个字段都不大于 `other` 的对应字段
    pub fn le_fieldwise(&self, other: &Self) -> bool {
        self.input_tokens <= other.input_tokens
            && self.output_tokens <= other.output_tokens
            && self.cache_create_tokens <= other.cache_create_tokens
            && self.cache_read_tokens <= other.cache_read_tokens
            && self.reasoning_tokens <= other.reasoning_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additions_saturate() {
        let mut usage = UsageCounters {
            input_tokens: u64::MAX - 1,
            ..Default::default()
        };
        usage.add_input(5);
        assert_eq!(usage.input_tokens, u64::MAX);
    }

    #[test]
    fn test_le_fieldwise() {
        let small = UsageCounters {
            input_tokens: 1,
            output_tokens: 2,
            ..Default::default()
        };
        let mut big = small.clone();
        big.add_reasoning(1);
        assert!(small.le_fieldwise(&big));
        assert!(!big.le_fieldwise(&small));
        assert!(UsageCounters::default().is_empty());
        assert!(!small.is_empty());
    }
}
