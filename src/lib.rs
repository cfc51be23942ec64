//! Hornet - Rust 自主任务执行引擎
//!
//! 模块划分：
//! - **actions**: 动作请求（封闭的标签联合体）、执行器抽象与自由文本提取协议
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、计划图、预算、反思、恢复与主控循环
//! - **llm**: 推理协作方抽象与实现（OpenAI 兼容 / Mock）

pub mod actions;
pub mod config;
pub mod core;
pub mod llm;
