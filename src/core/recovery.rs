//! 崩溃恢复：发现被中断的会话并按状态恢复
//!
//! 中断会话 = 快照中的状态既不是 Idle 也不是 Completed。
//! 每个状态有且只有一个恢复策略；恢复本身从不删除会话数据。
//! 独立的保留清理例程只删除「终结且超龄」的会话，被中断的会话无论多旧都保留。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::keys;
use crate::core::state::{MissionState, StateMachine};
use crate::core::AgentError;

/// 恢复统计（诊断用）
#[derive(Debug, Clone)]
pub struct RecoveryStats {
    pub total_sessions: usize,
    pub interrupted_sessions: usize,
    pub states: HashMap<String, usize>,
}

/// 恢复协调器
pub struct RecoveryCoordinator {
    sessions_dir: PathBuf,
}

impl RecoveryCoordinator {
    pub fn new(sessions_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
        }
    }

    /// 列出所有被中断的会话 ID
    pub fn find_interrupted_sessions(&self) -> Vec<String> {
        let mut interrupted = Vec::new();
        for session_id in self.list_session_ids() {
            let mut sm = StateMachine::new(&self.sessions_dir, Some(session_id.clone()));
            match sm.restore() {
                Ok(true) if !sm.state().is_settled() => {
                    tracing::warn!(
                        session = %session_id,
                        state = %sm.state(),
                        "interrupted session found"
                    );
                    interrupted.push(session_id);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "snapshot unreadable, skipping");
                }
            }
        }
        interrupted
    }

    /// 加载快照并应用该状态对应的恢复策略，返回可继续驱动的状态机
    pub fn recover(&self, session_id: &str) -> Result<StateMachine, AgentError> {
        let mut sm = StateMachine::new(&self.sessions_dir, Some(session_id.to_string()));
        if !sm.restore()? {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }

        let state = sm.state();
        tracing::info!(session = %session_id, state = %state, "recovering session");
        for record in sm.transition_history(3) {
            tracing::debug!(
                from = %record.from,
                to = %record.to,
                reason = %record.reason,
                "recent transition"
            );
        }

        match state {
            MissionState::Planning => self.recover_from_planning(&mut sm)?,
            MissionState::ExecutingStep => self.recover_from_executing(&mut sm)?,
            MissionState::AwaitingResult => self.recover_from_awaiting(&mut sm)?,
            MissionState::FailureAnalysis | MissionState::Responding => {
                // 幂等：从中断处原样继续
                tracing::info!(state = %state, "state is safe to resume unchanged");
            }
            MissionState::FatalError => self.recover_from_fatal(&mut sm)?,
            MissionState::Idle | MissionState::Completed => {
                tracing::info!(state = %state, "session is settled, nothing to recover");
            }
        }

        Ok(sm)
    }

    /// Planning 中断：丢弃可能不完整的计划，经恢复边回 Idle 后重新进入 Planning
    fn recover_from_planning(&self, sm: &mut StateMachine) -> Result<(), AgentError> {
        sm.set_plan(None)?;
        sm.recovery_transition_to(MissionState::Idle, "recovery: reset after planning crash")?;
        sm.transition_to(MissionState::Planning, "recovery: restarting planning")?;
        Ok(())
    }

    /// ExecutingStep 中断：有待执行动作则原样保留（下一轮会重试）；
    /// 否则经 AwaitingResult 进入失败分析，按未知失败处理
    fn recover_from_executing(&self, sm: &mut StateMachine) -> Result<(), AgentError> {
        if sm.get_data(keys::PENDING_ACTION).is_some() {
            tracing::info!("pending action found, next loop iteration will retry it");
            return Ok(());
        }
        sm.set_data(
            keys::ERROR_MESSAGE,
            serde_json::json!("Step execution was interrupted (unknown failure)"),
        )?;
        sm.transition_to(MissionState::AwaitingResult, "recovery: forcing awaiting state")?;
        sm.transition_to(
            MissionState::FailureAnalysis,
            "recovery: analyzing execution crash",
        )?;
        Ok(())
    }

    /// AwaitingResult 中断：合成中断错误并进入失败分析
    ///
    /// 挂起的动作视为已失败，清掉以免泄漏进后续的重试或新计划。
    fn recover_from_awaiting(&self, sm: &mut StateMachine) -> Result<(), AgentError> {
        sm.remove_data(keys::PENDING_ACTION)?;
        sm.set_data(
            keys::ERROR_MESSAGE,
            serde_json::json!("Action execution was interrupted (process crashed or timed out)"),
        )?;
        sm.transition_to(
            MissionState::FailureAnalysis,
            "recovery: action execution interrupted",
        )?;
        Ok(())
    }

    /// FatalError 中断：携带已存储的错误消息重新进入失败分析
    fn recover_from_fatal(&self, sm: &mut StateMachine) -> Result<(), AgentError> {
        if sm.get_data_str(keys::ERROR_MESSAGE).is_none() {
            sm.set_data(
                keys::ERROR_MESSAGE,
                serde_json::json!("Unknown error (crashed)"),
            )?;
        }
        sm.transition_to(
            MissionState::FailureAnalysis,
            "recovery: analyzing fatal error",
        )?;
        Ok(())
    }

    /// 保留清理：删除「终结且超过保留期」的会话快照
    ///
    /// 被中断的会话永不删除，无论多旧。返回删除数量。
    pub fn cleanup_old_sessions(&self, max_age_days: u32) -> Result<usize, AgentError> {
        let max_age_secs = f64::from(max_age_days) * 86_400.0;
        let mut deleted = 0;

        for session_id in self.list_session_ids() {
            let mut sm = StateMachine::new(&self.sessions_dir, Some(session_id.clone()));
            if !sm.restore().unwrap_or(false) {
                continue;
            }
            if !sm.state().is_settled() {
                continue;
            }

            let path = sm.session_file();
            let age_secs = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|age| age.as_secs_f64())
                .unwrap_or(0.0);

            if age_secs > max_age_secs {
                std::fs::remove_file(&path)?;
                deleted += 1;
                tracing::info!(
                    session = %session_id,
                    age_days = (age_secs / 86_400.0) as u64,
                    "old settled session deleted"
                );
            }
        }

        if deleted > 0 {
            tracing::info!(deleted, "session retention cleanup finished");
        }
        Ok(deleted)
    }

    /// 按状态统计会话（诊断用）
    pub fn recovery_statistics(&self) -> RecoveryStats {
        let mut stats = RecoveryStats {
            total_sessions: 0,
            interrupted_sessions: 0,
            states: HashMap::new(),
        };
        for session_id in self.list_session_ids() {
            let mut sm = StateMachine::new(&self.sessions_dir, Some(session_id));
            if !sm.restore().unwrap_or(false) {
                continue;
            }
            stats.total_sessions += 1;
            *stats.states.entry(sm.state().to_string()).or_insert(0) += 1;
            if !sm.state().is_settled() {
                stats.interrupted_sessions += 1;
            }
        }
        stats
    }

    /// 从 session_<id>.json 文件名提取会话 ID
    fn list_session_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name
                .strip_prefix("session_")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys;

    fn session_in(dir: &tempfile::TempDir, id: &str, target: MissionState) -> StateMachine {
        let mut sm = StateMachine::new(dir.path(), Some(id.to_string()));
        let path: &[MissionState] = match target {
            MissionState::Idle => &[],
            MissionState::Planning => &[MissionState::Planning],
            MissionState::ExecutingStep => {
                &[MissionState::Planning, MissionState::ExecutingStep]
            }
            MissionState::AwaitingResult => &[
                MissionState::Planning,
                MissionState::ExecutingStep,
                MissionState::AwaitingResult,
            ],
            MissionState::FailureAnalysis => &[
                MissionState::Planning,
                MissionState::ExecutingStep,
                MissionState::FailureAnalysis,
            ],
            MissionState::Responding => &[
                MissionState::Planning,
                MissionState::ExecutingStep,
                MissionState::Responding,
            ],
            MissionState::Completed => &[
                MissionState::Planning,
                MissionState::ExecutingStep,
                MissionState::Responding,
                MissionState::Completed,
            ],
            MissionState::FatalError => &[MissionState::Planning, MissionState::FatalError],
        };
        for state in path {
            sm.transition_to(*state, "test setup").unwrap();
        }
        sm
    }

    #[test]
    fn test_find_interrupted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        session_in(&dir, "mid_flight", MissionState::ExecutingStep);
        session_in(&dir, "done", MissionState::Completed);

        let coordinator = RecoveryCoordinator::new(dir.path());
        let interrupted = coordinator.find_interrupted_sessions();
        assert_eq!(interrupted, vec!["mid_flight".to_string()]);
    }

    #[test]
    fn test_recover_missing_session_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = RecoveryCoordinator::new(dir.path());
        let err = coordinator.recover("ghost").unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound(_)));
    }

    #[test]
    fn test_recover_from_planning_restarts_planning() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = session_in(&dir, "s", MissionState::Planning);
        sm.set_plan(Some(crate::core::plan::PlanGraph::default().snapshot()))
            .unwrap();

        let coordinator = RecoveryCoordinator::new(dir.path());
        let recovered = coordinator.recover("s").unwrap();
        assert_eq!(recovered.state(), MissionState::Planning);
        assert!(recovered.plan().is_none());
        // 经由恢复边 Planning -> Idle -> Planning
        let history = recovered.full_history();
        let tail: Vec<_> = history.iter().rev().take(2).collect();
        assert_eq!(tail[0].from, MissionState::Idle);
        assert_eq!(tail[1].to, MissionState::Idle);
    }

    #[test]
    fn test_recover_executing_with_pending_action_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = session_in(&dir, "s", MissionState::ExecutingStep);
        sm.set_data(
            keys::PENDING_ACTION,
            serde_json::json!({"action": "read_file", "path": "x.txt"}),
        )
        .unwrap();

        let coordinator = RecoveryCoordinator::new(dir.path());
        let recovered = coordinator.recover("s").unwrap();
        assert_eq!(recovered.state(), MissionState::ExecutingStep);
        assert!(recovered.get_data(keys::PENDING_ACTION).is_some());
    }

    #[test]
    fn test_recover_executing_without_pending_action_goes_to_analysis() {
        let dir = tempfile::tempdir().unwrap();
        session_in(&dir, "s", MissionState::ExecutingStep);

        let coordinator = RecoveryCoordinator::new(dir.path());
        let recovered = coordinator.recover("s").unwrap();
        assert_eq!(recovered.state(), MissionState::FailureAnalysis);
        assert!(recovered
            .get_data_str(keys::ERROR_MESSAGE)
            .unwrap()
            .contains("interrupted"));
    }

    #[test]
    fn test_recover_awaiting_synthesizes_interrupted_error() {
        let dir = tempfile::tempdir().unwrap();
        session_in(&dir, "s", MissionState::AwaitingResult);

        let coordinator = RecoveryCoordinator::new(dir.path());
        let recovered = coordinator.recover("s").unwrap();
        assert_eq!(recovered.state(), MissionState::FailureAnalysis);
        let error = recovered.get_data_str(keys::ERROR_MESSAGE).unwrap();
        assert!(error.contains("interrupted"));
    }

    #[test]
    fn test_recover_analysis_and_responding_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        session_in(&dir, "a", MissionState::FailureAnalysis);
        session_in(&dir, "r", MissionState::Responding);

        let coordinator = RecoveryCoordinator::new(dir.path());
        for _ in 0..2 {
            assert_eq!(
                coordinator.recover("a").unwrap().state(),
                MissionState::FailureAnalysis
            );
            assert_eq!(
                coordinator.recover("r").unwrap().state(),
                MissionState::Responding
            );
        }
    }

    #[test]
    fn test_recover_fatal_reenters_analysis_with_stored_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = session_in(&dir, "s", MissionState::FatalError);
        sm.set_data(keys::ERROR_MESSAGE, serde_json::json!("disk exploded"))
            .unwrap();

        let coordinator = RecoveryCoordinator::new(dir.path());
        let recovered = coordinator.recover("s").unwrap();
        assert_eq!(recovered.state(), MissionState::FailureAnalysis);
        assert_eq!(
            recovered.get_data_str(keys::ERROR_MESSAGE).as_deref(),
            Some("disk exploded")
        );
    }

    #[test]
    fn test_cleanup_deletes_only_old_settled_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let done = session_in(&dir, "old_done", MissionState::Completed);
        let stuck = session_in(&dir, "old_stuck", MissionState::AwaitingResult);
        // 快照已写盘，等一拍让文件年龄 > 0
        std::thread::sleep(std::time::Duration::from_millis(20));

        let coordinator = RecoveryCoordinator::new(dir.path());
        let deleted = coordinator.cleanup_old_sessions(0).unwrap();
        assert_eq!(deleted, 1);
        assert!(!done.session_file().exists());
        // 中断会话无论多旧都不删
        assert!(stuck.session_file().exists());
    }

    #[test]
    fn test_statistics_counts_states() {
        let dir = tempfile::tempdir().unwrap();
        session_in(&dir, "a", MissionState::Completed);
        session_in(&dir, "b", MissionState::ExecutingStep);
        session_in(&dir, "c", MissionState::AwaitingResult);

        let stats = RecoveryCoordinator::new(dir.path()).recovery_statistics();
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.interrupted_sessions, 2);
        assert_eq!(stats.states.get("completed"), Some(&1));
    }
}
