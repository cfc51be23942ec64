//! 引擎核心：状态机、计划图、预算、反思、恢复与主控循环

pub mod budget;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod reflection;
pub mod state;

pub use budget::{BudgetCheck, BudgetTracker, BudgetWarning, WarnLevel};
pub use error::AgentError;
pub use orchestrator::{MissionOrchestrator, MissionOutcome, MissionReport};
pub use plan::{PlanGraph, PlanProgress, PlanSnapshot, PlanStep, Planner, StepStatus};
pub use recovery::RecoveryCoordinator;
pub use reflection::{ReflectionAction, ReflectionPolicy, ReflectionVerdict};
pub use state::{MissionState, StateMachine, TransitionRecord};

/// 会话数据袋使用的键
pub mod keys {
    /// 待执行的动作请求（ActionRequest 的 JSON）
    pub const PENDING_ACTION: &str = "pending_action";
    /// 当前正在推进的步骤 ID
    pub const CURRENT_STEP_ID: &str = "current_step_id";
    /// 最近一次错误消息
    pub const ERROR_MESSAGE: &str = "error_message";
    /// AskUser 裁决生成的问题
    pub const USER_QUESTION: &str = "user_question";
    /// 任务结束时的总结
    pub const FINAL_SUMMARY: &str = "final_summary";
    /// 预算追踪器快照
    pub const BUDGET: &str = "budget";
    /// 任务的初始上下文
    pub const MISSION_CONTEXT: &str = "mission_context";

    /// 步骤重试计数的键
    pub fn attempts(step_id: u32) -> String {
        format!("step_{}_attempts", step_id)
    }
}
