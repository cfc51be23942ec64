//! LLM 客户端抽象与实现
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete 返回 (文本, 用量)。

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::LlmSection;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmUsage};

/// 根据配置与环境变量选择推理后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "mock" || !has_key {
        if provider != "mock" {
            tracing::warn!("No API key set, using Mock LLM");
        }
        return Arc::new(MockLlmClient::new());
    }

    tracing::info!(model = %cfg.model, "Using OpenAI-compatible LLM");
    Arc::new(OpenAiClient::new(
        cfg.base_url.as_deref(),
        &cfg.model,
        std::env::var("OPENAI_API_KEY").ok().as_deref(),
    ))
}
