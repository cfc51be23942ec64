//! Mock 推理客户端（测试与离线演示用，无需 API）
//!
//! 按顺序弹出预置响应；耗尽后返回固定的默认文本，便于脚本化驱动整条任务流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmUsage};

/// 预置响应记入的用量
const SCRIPTED_TOKENS: u64 = 100;
/// 默认响应记入的用量
const DEFAULT_TOKENS: u64 = 50;

/// Mock 客户端：队列化的预置响应
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条预置响应
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// 收到过的全部 prompt（断言提示词内容用）
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, prompt: &str) -> Result<(String, LlmUsage), String> {
        self.calls.lock().unwrap().push(prompt.to_string());

        let scripted = self.responses.lock().unwrap().pop_front();
        let (text, tokens) = match scripted {
            Some(response) => (response, SCRIPTED_TOKENS),
            None => ("Default response".to_string(), DEFAULT_TOKENS),
        };
        Ok((
            text,
            LlmUsage {
                prompt_tokens: tokens / 2,
                completion_tokens: tokens / 2,
                total_tokens: tokens,
                cost_units: Some(tokens),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pops_responses_in_order_then_falls_back() {
        let mock = MockLlmClient::with_responses(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(mock.complete("a").await.unwrap().0, "one");
        assert_eq!(mock.complete("b").await.unwrap().0, "two");
        assert_eq!(mock.complete("c").await.unwrap().0, "Default response");
        assert_eq!(mock.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_usage_feeds_budget_ledger() {
        let mock = MockLlmClient::with_responses(vec!["one".to_string()]);
        let (_, usage) = mock.complete("a").await.unwrap();
        assert_eq!(usage.billed_cost(), 100);
    }
}
