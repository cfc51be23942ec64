//! 反思策略：失败分诊与下一步建议
//!
//! 步骤失败后向推理协作方请求裁决（重试 / 调整后重试 / 重新规划 / 问用户 / 跳过）。
//! 响应不可解析时走确定性回退：尝试次数 ≤ 2 建议重试，≥ 3 建议求助用户。
//! 最近裁决保存在固定容量的环形缓冲中，供后续提示词与根因统计使用。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::parse::extract_json_payload;
use crate::llm::{LlmClient, LlmUsage};

/// 历史环形缓冲容量
const MAX_HISTORY: usize = 10;
/// 回退裁决的置信度
const FALLBACK_CONFIDENCE: f64 = 0.3;

/// 反思建议的动作（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionAction {
    /// 原样重试（瞬时错误）
    Retry,
    /// 调整后重试（带 modification_hint）
    RetryModified,
    /// 计划本身有问题，推倒重来
    Replanning,
    /// 需要用户决策
    AskUser,
    /// 该步骤非关键，可跳过
    SkipStep,
}

/// 一次失败分析的裁决
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionVerdict {
    pub analysis: String,
    pub root_cause: String,
    pub action: ReflectionAction,
    /// 置信度 [0, 1]
    pub confidence: f64,
    /// action = RetryModified 时的调整提示
    pub modification_hint: Option<String>,
}

/// 历史记录：失败裁决或成功标记
#[derive(Debug, Clone)]
pub struct ReflectionRecord {
    pub timestamp: DateTime<Utc>,
    pub step_id: u32,
    pub step_description: String,
    /// None 表示成功记录
    pub error: Option<String>,
    pub action: Option<ReflectionAction>,
    pub root_cause: Option<String>,
    pub confidence: Option<f64>,
}

/// 裁决的线格式
#[derive(Debug, Deserialize)]
struct VerdictWire {
    #[serde(default = "default_analysis")]
    analysis: String,
    #[serde(default = "default_root_cause")]
    root_cause: String,
    suggested_action: ReflectionAction,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    modification_hint: Option<String>,
}

fn default_analysis() -> String {
    "No analysis provided".to_string()
}

fn default_root_cause() -> String {
    "Unknown".to_string()
}

fn default_confidence() -> f64 {
    0.5
}

/// 反思策略：持有推理协作方与有界历史
pub struct ReflectionPolicy {
    llm: Arc<dyn LlmClient>,
    history: VecDeque<ReflectionRecord>,
}

impl ReflectionPolicy {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            history: VecDeque::new(),
        }
    }

    /// 分析失败步骤并给出裁决；解析或调用失败时应用确定性回退，从不返回错误
    pub async fn reflect_on_failure(
        &mut self,
        step_id: u32,
        step_description: &str,
        error_message: &str,
        attempt_count: u32,
        plan_context: &str,
    ) -> (ReflectionVerdict, LlmUsage) {
        let prompt = self.build_reflection_prompt(
            step_id,
            step_description,
            error_message,
            attempt_count,
            plan_context,
        );

        let (verdict, usage) = match self.llm.complete(&prompt).await {
            Ok((response, usage)) => match parse_verdict(&response) {
                Some(verdict) => (verdict, usage),
                None => {
                    tracing::warn!(step_id, "verdict unparseable, applying fallback");
                    (fallback_verdict(attempt_count), usage)
                }
            },
            Err(e) => {
                tracing::warn!(step_id, error = %e, "reflection call failed, applying fallback");
                (fallback_verdict(attempt_count), LlmUsage::default())
            }
        };

        self.record(ReflectionRecord {
            timestamp: Utc::now(),
            step_id,
            step_description: step_description.to_string(),
            error: Some(truncate(error_message, 200)),
            action: Some(verdict.action),
            root_cause: Some(verdict.root_cause.clone()),
            confidence: Some(verdict.confidence),
        });

        tracing::info!(
            step_id,
            action = ?verdict.action,
            confidence = verdict.confidence,
            root_cause = %verdict.root_cause,
            "reflection verdict"
        );
        (verdict, usage)
    }

    /// 成功步骤也记入历史（供模式识别的上下文）
    pub fn record_success(&mut self, step_id: u32, step_description: &str) {
        self.record(ReflectionRecord {
            timestamp: Utc::now(),
            step_id,
            step_description: step_description.to_string(),
            error: None,
            action: None,
            root_cause: None,
            confidence: None,
        });
    }

    fn record(&mut self, record: ReflectionRecord) {
        self.history.push_back(record);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> &VecDeque<ReflectionRecord> {
        &self.history
    }

    /// 根因出现次数统计（仅诊断用）
    pub fn failure_patterns(&self) -> HashMap<String, usize> {
        let mut patterns = HashMap::new();
        for record in &self.history {
            if let Some(cause) = &record.root_cause {
                *patterns.entry(cause.clone()).or_insert(0) += 1;
            }
        }
        patterns
    }

    /// 最常见的根因（仅诊断用）
    pub fn most_common_root_cause(&self) -> Option<String> {
        self.failure_patterns()
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(cause, _)| cause)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn build_reflection_prompt(
        &self,
        step_id: u32,
        step_description: &str,
        error_message: &str,
        attempt_count: u32,
        plan_context: &str,
    ) -> String {
        let history = self.format_history();
        let plan_context = if plan_context.is_empty() {
            "No plan context."
        } else {
            plan_context
        };
        format!(
            r#"You are a failure analyst for an autonomous agent. Analyze the failure below and recommend the best next step.

IMPORTANT: identify the ROOT CAUSE, not just the symptom.

FAILED STEP:
ID: {step_id}
Description: {step_description}

ERROR:
{error_message}

ATTEMPT NUMBER: {attempt_count}

PLAN CONTEXT:
{plan_context}

RECENT VERDICTS:
{history}

POSSIBLE ACTIONS:
- "retry": try the same step again (transient errors, e.g. network timeout)
- "retry_modified": try an adjusted version (change parameters or approach)
- "replanning": the plan itself is wrong or unrealistic, rebuild it
- "ask_user": a decision or clarification from the user is needed
- "skip_step": the step is not critical for the mission, skip it

HEURISTICS:
- The same error repeating (attempt > 2): consider "replanning" or "ask_user"
- Missing file / permission denied: often "retry_modified" with a different path
- Logic errors in the approach: usually "replanning"
- Network errors / timeouts: "retry"
- Ambiguous requirements: "ask_user"

RESPONSE FORMAT (JSON only):
{{
  "analysis": "short analysis of what happened (2-3 sentences)",
  "root_cause": "the real cause, not the symptom",
  "suggested_action": "retry|retry_modified|replanning|ask_user|skip_step",
  "confidence": 0.8,
  "modification_hint": "how to adjust the step if suggested_action=retry_modified, otherwise null"
}}"#
        )
    }

    /// 最近 3 条历史的提示词片段
    fn format_history(&self) -> String {
        if self.history.is_empty() {
            return "No previous verdicts.".to_string();
        }
        self.history
            .iter()
            .rev()
            .take(3)
            .rev()
            .enumerate()
            .map(|(i, record)| match (&record.error, record.action) {
                (Some(error), Some(action)) => format!(
                    "{}. step {}: {} -> {:?} (confidence {:.0}%)",
                    i + 1,
                    record.step_id,
                    truncate(error, 80),
                    action,
                    record.confidence.unwrap_or(0.0) * 100.0
                ),
                _ => format!("{}. step {}: succeeded", i + 1, record.step_id),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 解析裁决；未知动作名或缺字段都按解析失败处理
fn parse_verdict(response: &str) -> Option<ReflectionVerdict> {
    let payload = extract_json_payload(response)?;
    let wire: VerdictWire = serde_json::from_str(&payload).ok()?;
    Some(ReflectionVerdict {
        analysis: wire.analysis,
        root_cause: wire.root_cause,
        action: wire.suggested_action,
        confidence: wire.confidence.clamp(0.0, 1.0),
        modification_hint: wire.modification_hint,
    })
}

/// 确定性回退：前两次建议重试，之后建议求助用户
fn fallback_verdict(attempt_count: u32) -> ReflectionVerdict {
    if attempt_count <= 2 {
        ReflectionVerdict {
            analysis: "Verdict unavailable; falling back to a retry.".to_string(),
            root_cause: "Unknown (verdict parsing failed)".to_string(),
            action: ReflectionAction::Retry,
            confidence: FALLBACK_CONFIDENCE,
            modification_hint: None,
        }
    } else {
        ReflectionVerdict {
            analysis: "Repeated failure; falling back to asking the user.".to_string(),
            root_cause: "Unknown (verdict parsing failed)".to_string(),
            action: ReflectionAction::AskUser,
            confidence: FALLBACK_CONFIDENCE,
            modification_hint: None,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}
