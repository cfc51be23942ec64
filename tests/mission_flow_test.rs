//! 任务全流程集成测试
//!
//! 用脚本化的 Mock 协作方驱动整条状态机：规划 -> 执行 -> 汇总，
//! 以及重试、预算耗尽、重试超限与崩溃恢复等路径。

use std::sync::Arc;

use hornet::actions::MockActionExecutor;
use hornet::config::AppConfig;
use hornet::core::{
    keys, MissionOrchestrator, MissionOutcome, MissionState, PlanGraph, PlanStep,
    RecoveryCoordinator, StateMachine, StepStatus,
};
use hornet::llm::MockLlmClient;

fn config_in(dir: &tempfile::TempDir) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.sessions_dir = Some(dir.path().to_path_buf());
    cfg
}

fn plan_json(steps: &[(u32, &str, &[u32])]) -> String {
    let steps: Vec<serde_json::Value> = steps
        .iter()
        .map(|(id, description, deps)| {
            serde_json::json!({
                "id": id,
                "description": description,
                "dependencies": deps,
                "estimated_cost": 50,
            })
        })
        .collect();
    serde_json::json!({ "steps": steps }).to_string()
}

fn read_action(path: &str) -> String {
    format!(r#"ACTION: {{"action": "read_file", "path": "{}"}}"#, path)
}

fn retry_verdict() -> String {
    serde_json::json!({
        "analysis": "transient error",
        "root_cause": "network glitch",
        "suggested_action": "retry",
        "confidence": 0.9,
    })
    .to_string()
}

#[tokio::test]
async fn test_simple_mission_flow() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        plan_json(&[(1, "Read test.txt", &[])]),
        read_action("test.txt"),
        "Mission done: the file was read.".to_string(),
    ]));
    let executor = Arc::new(MockActionExecutor::new().with_result("read_file", "File content"));
    let mut orchestrator = MissionOrchestrator::new(&config_in(&dir), llm, executor.clone());

    let report = orchestrator
        .run_mission("Read test.txt", None)
        .await
        .unwrap();

    assert_eq!(report.outcome, MissionOutcome::Completed);
    assert_eq!(report.final_state, MissionState::Completed);
    assert_eq!(report.progress.completed, 1);
    assert_eq!(executor.call_count(), 1);
    assert!(report.summary.contains("1/1 steps completed"));
}

#[tokio::test]
async fn test_multi_step_mission_respects_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        plan_json(&[(1, "Read a.txt", &[]), (2, "Read b.txt", &[1])]),
        read_action("a.txt"),
        read_action("b.txt"),
        "Both files read.".to_string(),
    ]));
    let executor = Arc::new(MockActionExecutor::new());
    let mut orchestrator = MissionOrchestrator::new(&config_in(&dir), llm, executor.clone());

    let report = orchestrator
        .run_mission("Read two files", None)
        .await
        .unwrap();

    assert_eq!(report.outcome, MissionOutcome::Completed);
    assert_eq!(report.progress.completed, 2);

    let calls = executor.calls();
    assert_eq!(calls.len(), 2);
    // 依赖顺序：先 a.txt 后 b.txt
    assert_eq!(calls[0].describe(), "read_file a.txt");
    assert_eq!(calls[1].describe(), "read_file b.txt");
}

#[tokio::test]
async fn test_mission_recovers_from_transient_failure() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        plan_json(&[(1, "Flaky step", &[])]),
        read_action("flaky.txt"),
        retry_verdict(),
        read_action("flaky.txt"),
        "Eventually succeeded.".to_string(),
    ]));
    let executor = Arc::new(MockActionExecutor::new().with_failure_once("read_file"));
    let mut orchestrator = MissionOrchestrator::new(&config_in(&dir), llm, executor.clone());

    let report = orchestrator
        .run_mission("Survive a flaky action", None)
        .await
        .unwrap();

    assert_eq!(report.outcome, MissionOutcome::Completed);
    assert_eq!(report.progress.completed, 1);
    // 第一次失败 + 重试成功
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_budget_exhaustion_ends_mission_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(&dir);
    // 建计划本身记 100，剩余 50 不足步骤估算的 500
    cfg.budget.max_cost_units = 150;
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        r#"{"steps": [{"id": 1, "description": "Expensive step", "dependencies": [], "estimated_cost": 500}]}"#
            .to_string(),
    ]));
    let executor = Arc::new(MockActionExecutor::new());
    let mut orchestrator = MissionOrchestrator::new(&cfg, llm, executor.clone());

    let report = orchestrator
        .run_mission("Run out of budget", None)
        .await
        .unwrap();

    assert_eq!(report.outcome, MissionOutcome::Failed);
    assert_eq!(report.final_state, MissionState::Idle);
    assert!(report.summary.contains("budget exhausted"));
    // 动作从未执行
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_max_retries_exhaustion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        plan_json(&[(1, "Doomed step", &[])]),
        read_action("x.txt"),
        retry_verdict(),
        read_action("x.txt"),
        retry_verdict(),
        read_action("x.txt"),
        retry_verdict(),
        read_action("x.txt"),
        retry_verdict(), // 第 4 次分析：重试已超限，置信度再高也致命
    ]));
    let executor = Arc::new(MockActionExecutor::new().with_failure("read_file"));
    let mut orchestrator = MissionOrchestrator::new(&config_in(&dir), llm, executor.clone());

    let report = orchestrator
        .run_mission("Fail forever", None)
        .await
        .unwrap();

    assert_eq!(report.outcome, MissionOutcome::Failed);
    assert!(report.summary.contains("attempts"));
    // max_retries = 3：初次 + 3 次重试
    assert_eq!(executor.call_count(), 4);
}

#[tokio::test]
async fn test_crash_recovery_resumes_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(&dir);

    // 手工构造一个冻结在 AwaitingResult 的会话（相当于执行动作时进程被杀）
    {
        let mut plan =
            PlanGraph::from_steps(vec![PlanStep::new(1, "Read data.txt")]).unwrap();
        plan.mark_in_progress(1);

        let mut sm = StateMachine::new(dir.path(), Some("crashed".to_string()));
        sm.set_goal("Read data.txt").unwrap();
        sm.transition_to(MissionState::Planning, "mission goal received")
            .unwrap();
        sm.transition_to(MissionState::ExecutingStep, "plan created")
            .unwrap();
        sm.set_plan(Some(plan.snapshot())).unwrap();
        sm.set_data(keys::CURRENT_STEP_ID, serde_json::json!(1))
            .unwrap();
        sm.set_data(
            keys::PENDING_ACTION,
            serde_json::json!({"action": "read_file", "path": "data.txt"}),
        )
        .unwrap();
        sm.transition_to(MissionState::AwaitingResult, "action request extracted")
            .unwrap();
    }

    let coordinator = RecoveryCoordinator::new(dir.path());
    assert_eq!(coordinator.find_interrupted_sessions(), vec!["crashed"]);

    let state = coordinator.recover("crashed").unwrap();
    assert_eq!(state.state(), MissionState::FailureAnalysis);

    // 恢复后继续驱动：反思建议重试 -> 重新执行 -> 完成
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        retry_verdict(),
        read_action("data.txt"),
        "Recovered and finished.".to_string(),
    ]));
    let executor = Arc::new(MockActionExecutor::new().with_result("read_file", "data content"));
    let mut orchestrator = MissionOrchestrator::from_recovered(&cfg, state, llm, executor);

    let report = orchestrator.resume().await.unwrap();

    assert_eq!(report.outcome, MissionOutcome::Completed);
    assert_eq!(report.session_id, "crashed");
    assert_eq!(report.progress.completed, 1);
}

#[tokio::test]
async fn test_snapshot_reflects_final_mission_state() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::with_responses(vec![
        plan_json(&[(1, "Only step", &[])]),
        read_action("f.txt"),
        "Done.".to_string(),
    ]));
    let mut orchestrator = MissionOrchestrator::new(
        &config_in(&dir),
        llm,
        Arc::new(MockActionExecutor::new()),
    );
    let report = orchestrator.run_mission("Snapshot check", None).await.unwrap();

    let path = dir
        .path()
        .join(format!("session_{}.json", report.session_id));
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();

    assert_eq!(snapshot["current_state"], "completed");
    assert_eq!(snapshot["goal"], "Snapshot check");
    assert_eq!(snapshot["plan"]["steps"][0]["status"], "completed");
    assert!(!snapshot["transition_history"].as_array().unwrap().is_empty());

    // 恢复一个已完成的会话应该原样返回
    let coordinator = RecoveryCoordinator::new(dir.path());
    assert!(coordinator.find_interrupted_sessions().is_empty());
    let restored = coordinator.recover(&report.session_id).unwrap();
    assert_eq!(restored.state(), MissionState::Completed);
    assert_eq!(
        restored.plan().unwrap().steps[0].status,
        StepStatus::Completed
    );
}
