//! 引擎错误类型
//!
//! 与主控循环配合：PlanValidation / InvalidTransition / BudgetExceeded 致命终止，
//! LlmCall / ActionFailed 走反思分流，PlanParse / ActionParse 由回退策略兜底。

use thiserror::Error;

/// 任务执行过程中可能出现的错误（计划校验、状态迁移、协作方调用、预算等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 计划结构非法（重复 ID、悬空/自身/循环依赖）；对建计划是致命的，不重试
    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    /// 尝试了迁移表之外的状态迁移；属于编排器 bug，总是致命
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// 推理协作方调用失败；可恢复，交给反思策略
    #[error("LLM call failed: {0}")]
    LlmCall(String),

    /// 动作执行协作方失败；可恢复，交给反思策略
    #[error("Action execution failed: {0}")]
    ActionFailed(String),

    /// 预算耗尽；确定性终止，不重试
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// 计划响应无法解析
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    /// 动作请求无法从响应中提取
    #[error("Action parse error: {0}")]
    ActionParse(String),

    /// 计划未完成但没有可执行步骤（依赖死锁）
    #[error("Deadlock: no eligible step but plan is incomplete")]
    Deadlock,

    /// 主控循环迭代超限
    #[error("Iteration ceiling reached after {0} iterations")]
    IterationCeiling(usize),

    /// 指定会话没有持久化快照
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
