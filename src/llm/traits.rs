//! 推理协作方抽象
//!
//! 引擎是提示词导向的：complete 接收一段 prompt，返回 (响应文本, 用量元数据)。
//! 用量中的 cost_units 直接进预算台账；缺省时以 total_tokens 计。

use async_trait::async_trait;

/// 单次调用的用量元数据
#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// 后端报告的消耗成本（可选）；预算记账优先使用此值
    pub cost_units: Option<u64>,
}

impl LlmUsage {
    /// 记入预算台账的成本：后端报告值，缺省退回 total_tokens
    pub fn billed_cost(&self) -> u64 {
        self.cost_units.unwrap_or(self.total_tokens)
    }
}

/// 推理客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 执行一次完成调用
    async fn complete(&self, prompt: &str) -> Result<(String, LlmUsage), String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
