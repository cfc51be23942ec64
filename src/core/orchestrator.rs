//! 任务编排器：状态驱动的主控循环
//!
//! 读取当前状态 -> 调用对应 handler -> handler 变更计划/预算/状态机并请求迁移，
//! 循环直到 Completed / Idle，迭代上限兜底（任何 handler 的 bug 都不能造成无界循环）。
//! 仅有的挂起点是两个外部协作方调用；其余工作全部同步完成。

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::actions::{extract_action, action_catalog, ActionExecutor, ActionRequest};
use crate::config::AppConfig;
use crate::core::budget::BudgetTracker;
use crate::core::keys;
use crate::core::plan::{PlanGraph, PlanProgress, PlanStep, Planner};
use crate::core::reflection::{ReflectionAction, ReflectionPolicy};
use crate::core::state::{MissionState, StateMachine};
use crate::core::AgentError;
use crate::llm::LlmClient;

/// 建计划调用在台账中的保留步骤 ID（计划步骤从 1 起）
const PLANNING_STEP_ID: u32 = 0;

/// 任务结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionOutcome {
    Completed,
    Failed,
}

/// 任务报告：循环结束后返回给调用方
#[derive(Debug, Clone)]
pub struct MissionReport {
    pub session_id: String,
    pub final_state: MissionState,
    pub outcome: MissionOutcome,
    pub summary: String,
    pub progress: PlanProgress,
    pub budget_summary: String,
}

/// 任务编排器：组合状态机、计划、预算、反思与两个协作方
pub struct MissionOrchestrator {
    state: StateMachine,
    plan: PlanGraph,
    planner: Planner,
    reflection: ReflectionPolicy,
    budget: BudgetTracker,
    llm: Arc<dyn LlmClient>,
    executor: Arc<dyn ActionExecutor>,
    max_iterations: usize,
    max_retries: u32,
    max_plan_steps: usize,
}

impl MissionOrchestrator {
    /// 新会话编排器
    pub fn new(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let sessions_dir = cfg
            .app
            .sessions_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("sessions"));
        let state = StateMachine::new(sessions_dir, None);
        Self::assemble(cfg, state, PlanGraph::default(), None, llm, executor)
    }

    /// 从恢复后的状态机重建编排器：还原计划与已消耗预算
    pub fn from_recovered(
        cfg: &AppConfig,
        state: StateMachine,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let plan = state
            .plan()
            .cloned()
            .map(PlanGraph::from_snapshot)
            .unwrap_or_default();
        let budget = state
            .get_data(keys::BUDGET)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .map(BudgetTracker::deserialize);
        Self::assemble(cfg, state, plan, budget, llm, executor)
    }

    fn assemble(
        cfg: &AppConfig,
        state: StateMachine,
        plan: PlanGraph,
        budget: Option<BudgetTracker>,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let budget = budget.unwrap_or_else(|| {
            BudgetTracker::new(cfg.budget.max_cost_units, cfg.budget.max_time_seconds)
                .with_thresholds(cfg.budget.warning_threshold, cfg.budget.critical_threshold)
        });
        Self {
            state,
            plan,
            planner: Planner::new(llm.clone()),
            reflection: ReflectionPolicy::new(llm.clone()),
            budget,
            llm,
            executor,
            max_iterations: cfg.mission.max_iterations,
            max_retries: cfg.mission.max_retries,
            max_plan_steps: cfg.mission.max_plan_steps,
        }
    }

    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    pub fn state(&self) -> MissionState {
        self.state.state()
    }

    /// 启动一个新任务并驱动到结束
    pub async fn run_mission(
        &mut self,
        goal: &str,
        initial_context: Option<&str>,
    ) -> Result<MissionReport, AgentError> {
        if self.state.state() == MissionState::Completed {
            self.state
                .transition_to(MissionState::Idle, "starting a new mission")?;
        }
        self.state.set_goal(goal)?;
        if let Some(context) = initial_context {
            self.state.set_data(keys::MISSION_CONTEXT, json!(context))?;
        }
        tracing::info!(session = %self.state.session_id(), goal, "mission started");
        self.state
            .transition_to(MissionState::Planning, "mission goal received")?;
        self.run_loop().await
    }

    /// 继续一个恢复后的会话（状态机已处于中断时的状态）
    pub async fn resume(&mut self) -> Result<MissionReport, AgentError> {
        tracing::info!(
            session = %self.state.session_id(),
            state = %self.state.state(),
            "resuming mission"
        );
        self.run_loop().await
    }

    /// 主控循环：终态（Completed / Idle）之外持续派发，迭代上限强制致命
    async fn run_loop(&mut self) -> Result<MissionReport, AgentError> {
        let mut iterations = 0usize;
        while !matches!(
            self.state.state(),
            MissionState::Completed | MissionState::Idle
        ) {
            if iterations >= self.max_iterations {
                tracing::error!(
                    max_iterations = self.max_iterations,
                    "iteration ceiling reached, aborting"
                );
                self.state.set_data(
                    keys::ERROR_MESSAGE,
                    json!(format!(
                        "iteration ceiling reached after {} iterations",
                        self.max_iterations
                    )),
                )?;
                // Responding 没有通往 FatalError 的边；届时直接以错误结束
                if self
                    .state
                    .transition_to(MissionState::FatalError, "iteration ceiling")
                    .is_ok()
                {
                    self.handle_fatal_error().await?;
                }
                return Err(AgentError::IterationCeiling(self.max_iterations));
            }
            iterations += 1;
            tracing::debug!(iteration = iterations, state = %self.state.state(), "dispatch");

            match self.state.state() {
                MissionState::Planning => self.handle_planning().await?,
                MissionState::ExecutingStep => self.handle_executing_step().await?,
                MissionState::AwaitingResult => self.handle_awaiting_result().await?,
                MissionState::FailureAnalysis => self.handle_failure_analysis().await?,
                MissionState::Responding => self.handle_responding().await?,
                MissionState::FatalError => self.handle_fatal_error().await?,
                MissionState::Idle | MissionState::Completed => break,
            }
        }
        Ok(self.report())
    }

    // ==================== 状态 handler ====================

    /// Planning：建计划 -> 序列化进会话 -> ExecutingStep；任何失败致命
    async fn handle_planning(&mut self) -> Result<(), AgentError> {
        let goal = self.state.goal().to_string();
        let context = self
            .state
            .get_data_str(keys::MISSION_CONTEXT)
            .unwrap_or_default();

        match self
            .planner
            .create_plan(&goal, &context, self.max_plan_steps)
            .await
        {
            Ok((plan, usage)) => {
                self.budget.record_step_cost(
                    PLANNING_STEP_ID,
                    usage.billed_cost(),
                    0.0,
                    "plan creation",
                );
                self.persist_budget()?;
                self.plan = plan;
                self.sync_plan()?;
                self.state
                    .transition_to(MissionState::ExecutingStep, "plan created")
            }
            Err(e) => {
                self.state
                    .set_data(keys::ERROR_MESSAGE, json!(format!("planning failed: {}", e)))?;
                self.state
                    .transition_to(MissionState::FatalError, "planning failed")
            }
        }
    }

    /// ExecutingStep：选步骤、查预算、请求动作；无步骤时区分「完成」与「死锁」
    async fn handle_executing_step(&mut self) -> Result<(), AgentError> {
        // 恢复路径：有未执行完的动作，直接去重试
        if self.state.get_data(keys::PENDING_ACTION).is_some() {
            return self
                .state
                .transition_to(MissionState::AwaitingResult, "retrying pending action");
        }

        let Some(step) = self.plan.get_next_step().cloned() else {
            if self.plan.is_plan_complete() {
                return self
                    .state
                    .transition_to(MissionState::Responding, "plan complete");
            }
            self.state.set_data(
                keys::ERROR_MESSAGE,
                json!("deadlock: no eligible step but plan is incomplete"),
            )?;
            return self
                .state
                .transition_to(MissionState::FatalError, "dependency deadlock");
        };

        let check = self.budget.check_budget(step.estimated_cost);
        if !check.can_proceed {
            let detail = check
                .warning
                .map(|w| w.message)
                .unwrap_or_else(|| "budget exhausted".to_string());
            self.state.set_data(
                keys::ERROR_MESSAGE,
                json!(format!("budget exhausted before step {}: {}", step.id, detail)),
            )?;
            return self
                .state
                .transition_to(MissionState::FatalError, "budget exhausted");
        }
        if let Some(warning) = &check.warning {
            tracing::warn!(level = ?warning.level, message = %warning.message, "budget warning");
        }

        self.plan.mark_in_progress(step.id);
        self.sync_plan()?;
        self.state.set_data(keys::CURRENT_STEP_ID, json!(step.id))?;

        let prompt = self.build_step_prompt(&step);
        let started = Instant::now();
        match self.llm.complete(&prompt).await {
            Ok((response, usage)) => {
                self.budget.record_step_cost(
                    step.id,
                    usage.billed_cost(),
                    started.elapsed().as_secs_f64(),
                    &step.description,
                );
                self.persist_budget()?;

                match extract_action(&response) {
                    Ok(request) => {
                        self.state
                            .set_data(keys::PENDING_ACTION, serde_json::to_value(&request)?)?;
                        self.state.transition_to(
                            MissionState::AwaitingResult,
                            "action request extracted",
                        )
                    }
                    Err(e) => {
                        self.plan
                            .mark_failed(step.id, "no action request found in response");
                        self.sync_plan()?;
                        self.state
                            .set_data(keys::ERROR_MESSAGE, json!(e.to_string()))?;
                        self.state.transition_to(
                            MissionState::FailureAnalysis,
                            "no action request found",
                        )
                    }
                }
            }
            Err(e) => {
                self.plan.mark_failed(step.id, &e);
                self.sync_plan()?;
                self.state.set_data(
                    keys::ERROR_MESSAGE,
                    json!(format!("reasoning call failed: {}", e)),
                )?;
                self.state
                    .transition_to(MissionState::FailureAnalysis, "reasoning call failed")
            }
        }
    }

    /// AwaitingResult：执行挂起的动作；成功回 ExecutingStep，失败进失败分析
    async fn handle_awaiting_result(&mut self) -> Result<(), AgentError> {
        let Some(value) = self.state.get_data(keys::PENDING_ACTION).cloned() else {
            self.state.set_data(
                keys::ERROR_MESSAGE,
                json!("no pending action to execute"),
            )?;
            return self
                .state
                .transition_to(MissionState::FatalError, "missing pending action");
        };
        let request: ActionRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                self.state.set_data(
                    keys::ERROR_MESSAGE,
                    json!(format!("stored pending action is corrupt: {}", e)),
                )?;
                return self
                    .state
                    .transition_to(MissionState::FatalError, "corrupt pending action");
            }
        };
        let step_id = self
            .state
            .get_data_u64(keys::CURRENT_STEP_ID)
            .unwrap_or(0) as u32;

        tracing::info!(step_id, action = %request.describe(), "executing action");
        match self.executor.execute(&request).await {
            Ok(result) => {
                let actual_cost = self.budget.step_cost_total(step_id);
                let description = self
                    .plan
                    .step(step_id)
                    .map(|s| s.description.clone())
                    .unwrap_or_default();
                self.plan.mark_completed(step_id, &result, actual_cost);
                self.reflection.record_success(step_id, &description);
                self.sync_plan()?;
                self.state.remove_data(keys::PENDING_ACTION)?;
                self.state.remove_data(keys::CURRENT_STEP_ID)?;
                self.state
                    .transition_to(MissionState::ExecutingStep, "action succeeded")
            }
            Err(e) => {
                self.plan.mark_failed(step_id, &e);
                self.sync_plan()?;
                self.state
                    .set_data(keys::ERROR_MESSAGE, json!(format!("action failed: {}", e)))?;
                self.state.remove_data(keys::PENDING_ACTION)?;
                self.state
                    .transition_to(MissionState::FailureAnalysis, "action failed")
            }
        }
    }

    /// FailureAnalysis：反思裁决分流；重试超限无条件致命
    async fn handle_failure_analysis(&mut self) -> Result<(), AgentError> {
        let error = self
            .state
            .get_data_str(keys::ERROR_MESSAGE)
            .unwrap_or_else(|| "Unknown error".to_string());

        // 当前步骤：数据袋优先，其次计划里第一个失败步骤
        let step_id = self
            .state
            .get_data_u64(keys::CURRENT_STEP_ID)
            .map(|v| v as u32)
            .or_else(|| {
                self.plan
                    .steps()
                    .iter()
                    .find(|s| s.status == crate::core::plan::StepStatus::Failed)
                    .map(|s| s.id)
            });
        let Some(step_id) = step_id else {
            // 没有可归因的步骤（如恢复注入的会话级错误）：交给用户
            self.state.set_data(
                keys::USER_QUESTION,
                json!(format!(
                    "The mission was interrupted: {}. How should I proceed?",
                    error
                )),
            )?;
            return self
                .state
                .transition_to(MissionState::Responding, "no step to analyze");
        };

        let attempts_key = keys::attempts(step_id);
        let this_attempt = self.state.get_data_u64(&attempts_key).unwrap_or(0) as u32 + 1;
        self.state.set_data(&attempts_key, json!(this_attempt))?;

        let step_description = self
            .plan
            .step(step_id)
            .map(|s| s.description.clone())
            .unwrap_or_default();
        let plan_context = self.plan.render();
        let (verdict, usage) = self
            .reflection
            .reflect_on_failure(step_id, &step_description, &error, this_attempt, &plan_context)
            .await;
        if usage.total_tokens > 0 {
            self.budget.record_step_cost(
                step_id,
                usage.billed_cost(),
                0.0,
                "failure reflection",
            );
            self.persist_budget()?;
        }

        match verdict.action {
            ReflectionAction::Retry | ReflectionAction::RetryModified => {
                if this_attempt > self.max_retries {
                    self.state.set_data(
                        keys::ERROR_MESSAGE,
                        json!(format!(
                            "step {} failed after {} attempts (last error: {})",
                            step_id, self.max_retries, error
                        )),
                    )?;
                    return self
                        .state
                        .transition_to(MissionState::FatalError, "max retries exhausted");
                }
                let hint = if verdict.action == ReflectionAction::RetryModified {
                    verdict.modification_hint.as_deref()
                } else {
                    None
                };
                self.plan.reset_to_pending(step_id, hint);
                self.sync_plan()?;
                self.state
                    .transition_to(MissionState::ExecutingStep, "retrying step")
            }
            ReflectionAction::Replanning => {
                self.plan = PlanGraph::default();
                self.state.set_plan(None)?;
                self.state.remove_data(keys::PENDING_ACTION)?;
                self.state.remove_data(keys::CURRENT_STEP_ID)?;
                // 新计划会复用步骤 ID，旧的重试计数一并清掉
                self.state
                    .remove_data_keys(|k| k.starts_with("step_") && k.ends_with("_attempts"))?;
                self.state
                    .transition_to(MissionState::Planning, "replanning after failure")
            }
            ReflectionAction::AskUser => {
                self.state.set_data(
                    keys::USER_QUESTION,
                    json!(format!(
                        "Step {} keeps failing ({}). {} What should I do?",
                        step_id, verdict.root_cause, verdict.analysis
                    )),
                )?;
                self.state
                    .transition_to(MissionState::Responding, "user decision needed")
            }
            ReflectionAction::SkipStep => {
                self.plan.mark_skipped(step_id, &verdict.root_cause);
                self.sync_plan()?;
                self.state.remove_data(keys::CURRENT_STEP_ID)?;
                self.state
                    .transition_to(MissionState::ExecutingStep, "step skipped")
            }
        }
    }

    /// Responding：汇总进度（可选的 LLM 总结，失败不致命）-> Completed
    async fn handle_responding(&mut self) -> Result<(), AgentError> {
        let progress = self.plan.progress();
        let mut summary = match self.state.get_data_str(keys::USER_QUESTION) {
            Some(question) => format!("User input needed: {}", question),
            None => format!(
                "Mission finished: {}/{} steps completed ({:.0}%), {} skipped, {} failed.",
                progress.completed, progress.total, progress.percent, progress.skipped,
                progress.failed
            ),
        };

        match self.llm.complete(&self.build_summary_prompt()).await {
            Ok((text, usage)) => {
                self.budget.record_step_cost(
                    PLANNING_STEP_ID,
                    usage.billed_cost(),
                    0.0,
                    "mission summary",
                );
                self.persist_budget()?;
                if !text.trim().is_empty() {
                    summary.push('\n');
                    summary.push_str(text.trim());
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "summary generation failed, using plain progress");
            }
        }

        self.state.set_data(keys::FINAL_SUMMARY, json!(summary))?;
        self.state
            .transition_to(MissionState::Completed, "mission summarized")
    }

    /// FatalError：记录错误与预算总结 -> Idle；任务到此结束，没有跨任务的隐式重试
    async fn handle_fatal_error(&mut self) -> Result<(), AgentError> {
        let error = self
            .state
            .get_data_str(keys::ERROR_MESSAGE)
            .unwrap_or_else(|| "Unknown error".to_string());
        let budget_summary = self.budget.summary();
        tracing::error!(error = %error, budget = %budget_summary, "mission failed");
        self.state.set_data(
            keys::FINAL_SUMMARY,
            json!(format!("Mission failed: {}\n{}", error, budget_summary)),
        )?;
        self.state
            .transition_to(MissionState::Idle, "fatal error recorded")
    }

    // ==================== 辅助 ====================

    fn sync_plan(&mut self) -> Result<(), AgentError> {
        self.state.set_plan(Some(self.plan.snapshot()))
    }

    fn persist_budget(&mut self) -> Result<(), AgentError> {
        self.state
            .set_data(keys::BUDGET, serde_json::to_value(self.budget.serialize())?)
    }

    fn build_step_prompt(&self, step: &PlanStep) -> String {
        format!(
            r#"You are an autonomous agent working through a mission plan one step at a time.

MISSION GOAL:
{goal}

PLAN:
{plan}
CURRENT STEP:
{id}. {description}

AVAILABLE ACTIONS:
{catalog}

INSTRUCTION:
Execute the current step by choosing exactly one action. Respond with the marker `ACTION:` followed by a single JSON object, and nothing else.
Example:
ACTION:
{{"action": "read_file", "path": "src/main.rs"}}"#,
            goal = self.state.goal(),
            plan = self.plan.render(),
            id = step.id,
            description = step.description,
            catalog = action_catalog(),
        )
    }

    fn build_summary_prompt(&self) -> String {
        format!(
            "Summarize the outcome of this mission in 2-3 sentences for the user.\n\nGOAL:\n{}\n\nSTEP RESULTS:\n{}",
            self.state.goal(),
            self.plan.render()
        )
    }

    fn report(&self) -> MissionReport {
        let final_state = self.state.state();
        MissionReport {
            session_id: self.state.session_id().to_string(),
            final_state,
            outcome: if final_state == MissionState::Completed {
                MissionOutcome::Completed
            } else {
                MissionOutcome::Failed
            },
            summary: self
                .state
                .get_data_str(keys::FINAL_SUMMARY)
                .unwrap_or_default(),
            progress: self.plan.progress(),
            budget_summary: self.budget.summary(),
        }
    }
}
