//! 计划图：步骤、依赖校验与 FIFO 调度
//!
//! PlanGraph 持有一次任务的全部步骤与依赖边，构造时整体校验
//! （重复 ID / 悬空依赖 / 自依赖 / 环），校验失败不保留任何部分状态。
//! Planner 负责向推理协作方请求结构化计划并解析为 PlanGraph。
//! 步骤选取是计划声明顺序的线性扫描（FIFO），不做优先级调度。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::parse::extract_json_payload;
use crate::core::AgentError;
use crate::llm::{LlmClient, LlmUsage};

/// 单个步骤的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// 计划中的一个原子步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// 计划内唯一 ID（1 起）
    pub id: u32,
    pub description: String,
    /// 必须先完成的步骤 ID
    #[serde(default)]
    pub dependencies: Vec<u32>,
    pub status: StepStatus,
    /// 预估成本（cost units）
    #[serde(default)]
    pub estimated_cost: u64,
    /// 实际消耗
    #[serde(default)]
    pub actual_cost: u64,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            estimated_cost: 0,
            actual_cost: 0,
            result: None,
            error: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<u32>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_estimated_cost(mut self, cost: u64) -> Self {
        self.estimated_cost = cost;
        self
    }
}

/// 序列化的计划（写入会话快照的形式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub steps: Vec<PlanStep>,
    pub created_at: Option<DateTime<Utc>>,
}

/// 按状态统计的进度
#[derive(Debug, Clone, Serialize)]
pub struct PlanProgress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percent: f64,
}

/// 一次任务的计划图；归属于单个会话，禁止作为进程级单例共享
#[derive(Debug, Clone, Default)]
pub struct PlanGraph {
    steps: Vec<PlanStep>,
    created_at: Option<DateTime<Utc>>,
}

impl PlanGraph {
    /// 从步骤列表构建并整体校验；任何校验失败都不保留部分状态
    pub fn from_steps(steps: Vec<PlanStep>) -> Result<Self, AgentError> {
        let graph = Self {
            steps,
            created_at: Some(Utc::now()),
        };
        graph.validate()?;
        Ok(graph)
    }

    /// 校验：重复 ID、悬空依赖、自依赖、环
    fn validate(&self) -> Result<(), AgentError> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id) {
                return Err(AgentError::PlanValidation(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if *dep == step.id {
                    return Err(AgentError::PlanValidation(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep) {
                    return Err(AgentError::PlanValidation(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }
        self.check_for_cycles()
    }

    /// 深度优先环检测：显式维护递归栈，栈上节点被再次访问即为环
    fn check_for_cycles(&self) -> Result<(), AgentError> {
        let deps: HashMap<u32, &[u32]> = self
            .steps
            .iter()
            .map(|s| (s.id, s.dependencies.as_slice()))
            .collect();

        let mut visited: HashSet<u32> = HashSet::new();
        for start in self.steps.iter().map(|s| s.id) {
            if visited.contains(&start) {
                continue;
            }
            // (节点, 下一个待访问的依赖下标)
            let mut stack: Vec<(u32, usize)> = vec![(start, 0)];
            let mut on_path: HashSet<u32> = HashSet::new();
            on_path.insert(start);
            visited.insert(start);

            while let Some((node, idx)) = stack.last().copied() {
                let node_deps = deps.get(&node).copied().unwrap_or(&[]);
                if idx < node_deps.len() {
                    stack.last_mut().expect("stack is non-empty").1 += 1;
                    let dep = node_deps[idx];
                    if on_path.contains(&dep) {
                        return Err(AgentError::PlanValidation(format!(
                            "cyclic dependency involving step {}",
                            dep
                        )));
                    }
                    if !visited.contains(&dep) {
                        visited.insert(dep);
                        on_path.insert(dep);
                        stack.push((dep, 0));
                    }
                } else {
                    on_path.remove(&node);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// 下一个可执行步骤：按计划声明顺序扫描，取第一个所有依赖均已完成的 pending 步骤
    pub fn get_next_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending && self.dependencies_met(s))
    }

    fn dependencies_met(&self, step: &PlanStep) -> bool {
        step.dependencies.iter().all(|dep| {
            self.steps
                .iter()
                .find(|s| s.id == *dep)
                .map(|s| s.status == StepStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// 所有步骤均为 completed 或 skipped 时计划完成
    pub fn is_plan_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn step(&self, id: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    fn step_mut(&mut self, id: u32) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn mark_in_progress(&mut self, id: u32) -> bool {
        match self.step_mut(id) {
            Some(step) => {
                step.status = StepStatus::InProgress;
                true
            }
            None => false,
        }
    }

    pub fn mark_completed(&mut self, id: u32, result: impl Into<String>, actual_cost: u64) -> bool {
        match self.step_mut(id) {
            Some(step) => {
                step.status = StepStatus::Completed;
                step.result = Some(result.into());
                step.actual_cost = actual_cost;
                step.error = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, id: u32, error: impl Into<String>) -> bool {
        match self.step_mut(id) {
            Some(step) => {
                step.status = StepStatus::Failed;
                step.error = Some(error.into());
                true
            }
            None => false,
        }
    }

    pub fn mark_skipped(&mut self, id: u32, reason: impl Into<String>) -> bool {
        match self.step_mut(id) {
            Some(step) => {
                step.status = StepStatus::Skipped;
                step.result = Some(format!("skipped: {}", reason.into()));
                true
            }
            None => false,
        }
    }

    /// 将失败步骤重置为 pending；仅供反思驱动的重试调用
    ///
    /// amendment 存在时追加到描述，提示下次换一种做法。
    pub fn reset_to_pending(&mut self, id: u32, amendment: Option<&str>) -> bool {
        match self.step_mut(id) {
            Some(step) => {
                step.status = StepStatus::Pending;
                step.error = None;
                if let Some(hint) = amendment {
                    step.description = format!("{}\n[adjusted] {}", step.description, hint);
                }
                true
            }
            None => false,
        }
    }

    /// 进度统计与完成百分比
    pub fn progress(&self) -> PlanProgress {
        let total = self.steps.len();
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        let completed = count(StepStatus::Completed);
        PlanProgress {
            total,
            pending: count(StepStatus::Pending),
            in_progress: count(StepStatus::InProgress),
            completed,
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
            percent: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// 渲染为提示词用的文本快照
    pub fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            let marker = match step.status {
                StepStatus::Pending => " ",
                StepStatus::InProgress => ">",
                StepStatus::Completed => "x",
                StepStatus::Failed => "!",
                StepStatus::Skipped => "-",
            };
            let deps = if step.dependencies.is_empty() {
                String::new()
            } else {
                format!(
                    " (depends on: {})",
                    step.dependencies
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            out.push_str(&format!(
                "[{}] {}. {}{}\n",
                marker, step.id, step.description, deps
            ));
        }
        out
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 序列化为快照；与 from_snapshot 严格往返（步骤顺序与状态不变）
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            steps: self.steps.clone(),
            created_at: self.created_at,
        }
    }

    /// 从自身产生的快照恢复；不重新校验（快照来自已校验的计划）
    pub fn from_snapshot(snapshot: PlanSnapshot) -> Self {
        Self {
            steps: snapshot.steps,
            created_at: snapshot.created_at,
        }
    }
}

/// LLM 计划响应的线格式：{"steps": [...]} 或裸数组
#[derive(Debug, Deserialize)]
struct PlanWire {
    steps: Vec<PlanStepWire>,
}

#[derive(Debug, Deserialize)]
struct PlanStepWire {
    id: u32,
    description: String,
    #[serde(default)]
    dependencies: Vec<u32>,
    #[serde(default = "default_step_cost")]
    estimated_cost: u64,
}

fn default_step_cost() -> u64 {
    500
}

/// Planner：持有推理协作方，create_plan 请求结构化计划并解析校验
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 请求计划：解析（容忍 markdown 包裹/散文混排）、截断到 max_steps、整体校验
    pub async fn create_plan(
        &self,
        goal: &str,
        context: &str,
        max_steps: usize,
    ) -> Result<(PlanGraph, LlmUsage), AgentError> {
        let prompt = build_planning_prompt(goal, context, max_steps);
        let (response, usage) = self
            .llm
            .complete(&prompt)
            .await
            .map_err(AgentError::LlmCall)?;

        let mut steps = parse_plan_steps(&response)?;
        steps.truncate(max_steps);
        let graph = PlanGraph::from_steps(steps)?;
        tracing::info!(
            steps = graph.steps().len(),
            estimated_total = graph.steps().iter().map(|s| s.estimated_cost).sum::<u64>(),
            "plan created"
        );
        Ok((graph, usage))
    }
}

fn build_planning_prompt(goal: &str, context: &str, max_steps: usize) -> String {
    let context = if context.is_empty() {
        "No additional context."
    } else {
        context
    };
    format!(
        r#"You are a strategic planner for an autonomous agent. Break the goal below into concrete, executable steps.

GOAL:
{goal}

CONTEXT:
{context}

PLAN REQUIREMENTS:
1. Every step must be atomic (one clear action)
2. Every step must be verifiable (success or failure can be checked)
3. Order the steps logically; if a step depends on another, list it in "dependencies"
4. Estimate each step's cost in cost units (100-2000)
5. At most {max_steps} steps

RESPONSE FORMAT (JSON only, no markdown):
{{
  "steps": [
    {{"id": 1, "description": "...", "dependencies": [], "estimated_cost": 500}}
  ]
}}"#
    )
}

/// 从 LLM 响应解析步骤列表；接受 {{"steps": [...]}} 或裸数组两种形式
fn parse_plan_steps(response: &str) -> Result<Vec<PlanStep>, AgentError> {
    let payload = extract_json_payload(response)
        .ok_or_else(|| AgentError::PlanParse("no JSON object found in response".to_string()))?;

    let wires: Vec<PlanStepWire> = match serde_json::from_str::<PlanWire>(&payload) {
        Ok(wire) => wire.steps,
        Err(_) => serde_json::from_str::<Vec<PlanStepWire>>(&payload)
            .map_err(|e| AgentError::PlanParse(format!("{}: {}", e, payload)))?,
    };

    Ok(wires
        .into_iter()
        .map(|w| {
            PlanStep::new(w.id, w.description)
                .with_dependencies(w.dependencies)
                .with_estimated_cost(w.estimated_cost)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn three_step_plan() -> PlanGraph {
        PlanGraph::from_steps(vec![
            PlanStep::new(1, "Step 1"),
            PlanStep::new(2, "Step 2").with_dependencies(vec![1]),
            PlanStep::new(3, "Step 3").with_dependencies(vec![1, 2]),
        ])
        .unwrap()
    }

    #[test]
    fn test_next_step_follows_dependency_order() {
        let mut plan = three_step_plan();
        assert_eq!(plan.get_next_step().unwrap().id, 1);

        plan.mark_completed(1, "done", 10);
        assert_eq!(plan.get_next_step().unwrap().id, 2);

        plan.mark_completed(2, "done", 10);
        assert_eq!(plan.get_next_step().unwrap().id, 3);

        plan.mark_completed(3, "done", 10);
        assert!(plan.get_next_step().is_none());
        assert!(plan.is_plan_complete());
    }

    #[test]
    fn test_two_step_cycle_rejected_at_creation() {
        let err = PlanGraph::from_steps(vec![
            PlanStep::new(1, "Step 1").with_dependencies(vec![2]),
            PlanStep::new(2, "Step 2").with_dependencies(vec![1]),
        ])
        .unwrap_err();
        assert!(matches!(err, AgentError::PlanValidation(_)));
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_longer_cycle_rejected() {
        let err = PlanGraph::from_steps(vec![
            PlanStep::new(1, "a").with_dependencies(vec![3]),
            PlanStep::new(2, "b").with_dependencies(vec![1]),
            PlanStep::new(3, "c").with_dependencies(vec![2]),
        ])
        .unwrap_err();
        assert!(matches!(err, AgentError::PlanValidation(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = PlanGraph::from_steps(vec![PlanStep::new(1, "a"), PlanStep::new(1, "b")])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let err =
            PlanGraph::from_steps(vec![PlanStep::new(1, "a").with_dependencies(vec![99])])
                .unwrap_err();
        assert!(err.to_string().contains("unknown step 99"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = PlanGraph::from_steps(vec![PlanStep::new(1, "a").with_dependencies(vec![1])])
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn test_acyclic_diamond_accepted() {
        let plan = PlanGraph::from_steps(vec![
            PlanStep::new(1, "root"),
            PlanStep::new(2, "left").with_dependencies(vec![1]),
            PlanStep::new(3, "right").with_dependencies(vec![1]),
            PlanStep::new(4, "join").with_dependencies(vec![2, 3]),
        ]);
        assert!(plan.is_ok());
    }

    #[test]
    fn test_skipped_dependency_does_not_unblock() {
        let mut plan = PlanGraph::from_steps(vec![
            PlanStep::new(1, "a"),
            PlanStep::new(2, "b").with_dependencies(vec![1]),
        ])
        .unwrap();
        plan.mark_skipped(1, "not critical");
        // 依赖要求 completed，skipped 不满足
        assert!(plan.get_next_step().is_none());
        assert!(!plan.is_plan_complete());
    }

    #[test]
    fn test_plan_complete_with_skipped_steps() {
        let mut plan = PlanGraph::from_steps(vec![PlanStep::new(1, "a"), PlanStep::new(2, "b")])
            .unwrap();
        plan.mark_completed(1, "done", 5);
        plan.mark_skipped(2, "optional");
        assert!(plan.is_plan_complete());
    }

    #[test]
    fn test_progress_counts_and_percent() {
        let mut plan = three_step_plan();
        plan.mark_completed(1, "done", 10);
        plan.mark_in_progress(2);
        let progress = plan.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.pending, 1);
        assert!((progress.percent - 100.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_reset_to_pending_with_amendment() {
        let mut plan = three_step_plan();
        plan.mark_in_progress(1);
        plan.mark_failed(1, "path not found");
        assert!(plan.has_failures());

        plan.reset_to_pending(1, Some("use an absolute path"));
        let step = plan.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.error.is_none());
        assert!(step.description.contains("use an absolute path"));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_order_and_status() {
        let mut plan = three_step_plan();
        plan.mark_completed(1, "result 1", 42);
        plan.mark_in_progress(2);

        let json = serde_json::to_string(&plan.snapshot()).unwrap();
        let restored = PlanGraph::from_snapshot(serde_json::from_str(&json).unwrap());

        let ids: Vec<u32> = restored.steps().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(restored.step(1).unwrap().status, StepStatus::Completed);
        assert_eq!(restored.step(1).unwrap().actual_cost, 42);
        assert_eq!(restored.step(2).unwrap().status, StepStatus::InProgress);
        assert_eq!(restored.step(3).unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_plan_from_plain_json() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"steps": [{"id": 1, "description": "Read the file", "dependencies": []},
                          {"id": 2, "description": "Summarize it", "dependencies": [1]}]}"#
                .to_string(),
        ]));
        let planner = Planner::new(llm);
        let (plan, _usage) = planner.create_plan("Summarize a file", "", 10).await.unwrap();
        assert_eq!(plan.steps().len(), 2);
        assert_eq!(plan.step(2).unwrap().dependencies, vec![1]);
    }

    #[tokio::test]
    async fn test_create_plan_from_markdown_block() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            "Here is the plan:\n\n```json\n{\"steps\": [{\"id\": 1, \"description\": \"First step\"}]}\n```\n\nThat's it!"
                .to_string(),
        ]));
        let planner = Planner::new(llm);
        let (plan, _usage) = planner.create_plan("Test", "", 10).await.unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.step(1).unwrap().estimated_cost, 500);
    }

    #[tokio::test]
    async fn test_create_plan_truncates_to_max_steps() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"steps": [{"id": 1, "description": "a"}, {"id": 2, "description": "b"},
                          {"id": 3, "description": "c"}]}"#
                .to_string(),
        ]));
        let planner = Planner::new(llm);
        let (plan, _usage) = planner.create_plan("Test", "", 2).await.unwrap();
        assert_eq!(plan.steps().len(), 2);
    }

    #[tokio::test]
    async fn test_create_plan_rejects_prose_response() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            "I cannot produce a plan right now.".to_string(),
        ]));
        let planner = Planner::new(llm);
        let err = planner.create_plan("Test", "", 10).await.unwrap_err();
        assert!(matches!(err, AgentError::PlanParse(_)));
    }
}
