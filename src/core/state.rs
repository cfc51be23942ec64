//! 任务状态机：固定迁移表 + 同步快照持久化
//!
//! 8 个状态，每次迁移先对照迁移表校验，通过后追加迁移记录并同步落盘。
//! 恢复路径使用独立的恢复迁移表（recovery_transition_to），不污染正常表，
//! 状态图不变式在恢复期间依然可校验。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::plan::PlanSnapshot;
use crate::core::AgentError;

/// 任务状态机的全部状态
///
/// 注意：新增状态时必须同步更新 allowed_transitions！
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    /// 初始态：无任务进行
    Idle,
    /// 正在向推理协作方请求计划
    Planning,
    /// 正在选取并推进下一个计划步骤
    ExecutingStep,
    /// 等待动作执行协作方返回结果
    AwaitingResult,
    /// 失败分析：由反思策略决定下一步
    FailureAnalysis,
    /// 汇总进度、生成回复
    Responding,
    /// 终态：任务完成
    Completed,
    /// 致命错误，记录后回到 Idle
    FatalError,
}

impl MissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionState::Idle => "idle",
            MissionState::Planning => "planning",
            MissionState::ExecutingStep => "executing_step",
            MissionState::AwaitingResult => "awaiting_result",
            MissionState::FailureAnalysis => "failure_analysis",
            MissionState::Responding => "responding",
            MissionState::Completed => "completed",
            MissionState::FatalError => "fatal_error",
        }
    }

    /// 终结态：Idle（初始）或 Completed（终态）；其余状态的会话视为「被中断」
    pub fn is_settled(&self) -> bool {
        matches!(self, MissionState::Idle | MissionState::Completed)
    }
}

impl std::fmt::Display for MissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 正常运行的迁移表：{当前状态 -> 允许的下一状态}
pub fn allowed_transitions(state: MissionState) -> &'static [MissionState] {
    use MissionState::*;
    match state {
        Idle => &[Planning],
        Planning => &[ExecutingStep, Responding, FatalError],
        ExecutingStep => &[AwaitingResult, FailureAnalysis, Responding, FatalError],
        AwaitingResult => &[FailureAnalysis, ExecutingStep, FatalError],
        FailureAnalysis => &[Planning, ExecutingStep, Responding, FatalError],
        Responding => &[Completed, ExecutingStep, Planning],
        Completed => &[Idle],
        FatalError => &[Idle, FailureAnalysis],
    }
}

/// 恢复专用的附加迁移边；仅 recovery_transition_to 接受
///
/// Planning 崩溃后需要回到 Idle 重新建计划，这条边不属于正常运行路径。
pub fn recovery_transitions(state: MissionState) -> &'static [MissionState] {
    use MissionState::*;
    match state {
        Planning => &[Idle],
        _ => &[],
    }
}

/// 一次状态迁移的不可变记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: MissionState,
    pub to: MissionState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// 会话快照：每次迁移与数据变更后整体写入 sessions/session_<id>.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub goal: String,
    pub current_state: MissionState,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub plan: Option<PlanSnapshot>,
    #[serde(default)]
    pub transition_history: Vec<TransitionRecord>,
    pub last_updated: DateTime<Utc>,
}

/// 状态机：持有当前状态、数据袋与迁移历史，负责校验迁移并同步持久化
///
/// 单写者：同一会话同一时刻只允许一个编排循环写快照。
#[derive(Debug)]
pub struct StateMachine {
    sessions_dir: PathBuf,
    session_id: String,
    goal: String,
    current: MissionState,
    data: HashMap<String, serde_json::Value>,
    plan: Option<PlanSnapshot>,
    history: Vec<TransitionRecord>,
}

impl StateMachine {
    /// 创建状态机；session_id 为空时自动生成 UUID
    pub fn new(sessions_dir: impl AsRef<Path>, session_id: Option<String>) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
            session_id: session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            goal: String::new(),
            current: MissionState::Idle,
            data: HashMap::new(),
            plan: None,
            history: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> MissionState {
        self.current
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    /// 设置任务目标并落盘
    pub fn set_goal(&mut self, goal: impl Into<String>) -> Result<(), AgentError> {
        self.goal = goal.into();
        self.persist()
    }

    /// 会话快照文件路径：sessions/session_<id>.json
    pub fn session_file(&self) -> PathBuf {
        self.sessions_dir
            .join(format!("session_{}.json", self.session_id))
    }

    /// 尝试迁移到新状态；不在迁移表中则返回 InvalidTransition
    ///
    /// 成功时追加迁移记录并在返回前同步写入完整快照。
    pub fn transition_to(
        &mut self,
        new_state: MissionState,
        reason: &str,
    ) -> Result<(), AgentError> {
        if !allowed_transitions(self.current).contains(&new_state) {
            return Err(AgentError::InvalidTransition {
                from: self.current.to_string(),
                to: new_state.to_string(),
            });
        }
        self.apply_transition(new_state, reason)
    }

    /// 恢复专用迁移：正常表与恢复表的并集内有效
    pub fn recovery_transition_to(
        &mut self,
        new_state: MissionState,
        reason: &str,
    ) -> Result<(), AgentError> {
        if !allowed_transitions(self.current).contains(&new_state)
            && !recovery_transitions(self.current).contains(&new_state)
        {
            return Err(AgentError::InvalidTransition {
                from: self.current.to_string(),
                to: new_state.to_string(),
            });
        }
        self.apply_transition(new_state, reason)
    }

    fn apply_transition(
        &mut self,
        new_state: MissionState,
        reason: &str,
    ) -> Result<(), AgentError> {
        let old_state = self.current;
        self.history.push(TransitionRecord {
            from: old_state,
            to: new_state,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.current = new_state;
        self.persist()?;
        tracing::info!(
            session = %self.session_id,
            from = %old_state,
            to = %new_state,
            reason,
            "state transition"
        );
        Ok(())
    }

    /// 写入数据袋并落盘（值须为 JSON 可序列化）
    pub fn set_data(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), AgentError> {
        self.data.insert(key.into(), value);
        self.persist()
    }

    pub fn get_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// 读取字符串值的便捷方法
    pub fn get_data_str(&self, key: &str) -> Option<String> {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// 读取整数值的便捷方法
    pub fn get_data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(|v| v.as_u64())
    }

    /// 删除数据袋键并落盘
    pub fn remove_data(&mut self, key: &str) -> Result<Option<serde_json::Value>, AgentError> {
        let removed = self.data.remove(key);
        self.persist()?;
        Ok(removed)
    }

    /// 按谓词移除一组键并落盘（如替换计划时清掉全部重试计数）
    pub fn remove_data_keys(
        &mut self,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<(), AgentError> {
        self.data.retain(|k, _| !predicate(k));
        self.persist()
    }

    /// 更新序列化后的计划并落盘
    pub fn set_plan(&mut self, plan: Option<PlanSnapshot>) -> Result<(), AgentError> {
        self.plan = plan;
        self.persist()
    }

    pub fn plan(&self) -> Option<&PlanSnapshot> {
        self.plan.as_ref()
    }

    /// 将完整快照同步写入会话文件；目录不存在时自动创建
    pub fn persist(&self) -> Result<(), AgentError> {
        std::fs::create_dir_all(&self.sessions_dir)?;
        let snapshot = SessionSnapshot {
            session_id: self.session_id.clone(),
            goal: self.goal.clone(),
            current_state: self.current,
            data: self.data.clone(),
            plan: self.plan.clone(),
            transition_history: self.history.clone(),
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(self.session_file(), json)?;
        Ok(())
    }

    /// 从快照文件恢复；文件不存在返回 Ok(false)，不算错误
    pub fn restore(&mut self) -> Result<bool, AgentError> {
        let path = self.session_file();
        if !path.exists() {
            return Ok(false);
        }
        let data = std::fs::read_to_string(&path)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&data)?;
        self.session_id = snapshot.session_id;
        self.goal = snapshot.goal;
        self.current = snapshot.current_state;
        self.data = snapshot.data;
        self.plan = snapshot.plan;
        self.history = snapshot.transition_history;
        tracing::info!(session = %self.session_id, state = %self.current, "session restored");
        Ok(true)
    }

    /// 重置为 Idle（新任务前）；不删除快照文件，只重置内存态并落盘
    pub fn reset(&mut self) -> Result<(), AgentError> {
        self.current = MissionState::Idle;
        self.goal.clear();
        self.data.clear();
        self.plan = None;
        self.history.clear();
        self.persist()
    }

    /// 最近 limit 条迁移记录
    pub fn transition_history(&self, limit: usize) -> &[TransitionRecord] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }

    pub fn full_history(&self) -> &[TransitionRecord] {
        &self.history
    }
}
