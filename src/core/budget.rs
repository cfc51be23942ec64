//! 预算追踪：成本单位与耗时的消耗记账
//!
//! 检查点式治理：每步执行前调用 check_budget，不做抢占式计时。
//! 计数器单调不减，只有 reset 可以清零；台账按记录顺序追加，
//! 总量与记录顺序无关。

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 时间下限：剩余时间低于此值即不允许开始新步骤（秒）
const MIN_TIME_FLOOR_SECS: f64 = 60.0;

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Critical,
}

/// 预算状态告警
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub level: WarnLevel,
    pub message: String,
    pub cost_remaining: u64,
    pub time_remaining: f64,
}

/// check_budget 的结果
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub can_proceed: bool,
    pub warning: Option<BudgetWarning>,
    pub cost_remaining: u64,
    pub time_remaining: f64,
    pub cost_used_fraction: f64,
    pub time_used_fraction: f64,
}

/// 台账中的一条步骤开销记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step_id: u32,
    pub cost: u64,
    pub seconds: f64,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

/// 台账均值
#[derive(Debug, Clone, Copy)]
pub struct AverageStepCost {
    pub cost: f64,
    pub seconds: f64,
}

/// 可序列化的追踪器状态（恢复任务时还原已消耗预算）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_cost_units: u64,
    pub max_time_seconds: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub cost_used: u64,
    pub elapsed_seconds: f64,
    pub ledger: Vec<LedgerEntry>,
}

/// 预算追踪器
pub struct BudgetTracker {
    max_cost_units: u64,
    max_time_seconds: u64,
    warning_threshold: f64,
    critical_threshold: f64,
    cost_used: u64,
    ledger: Vec<LedgerEntry>,
    warnings_issued: Vec<BudgetWarning>,
    started_at: Instant,
    /// 恢复会话时带入的已消耗时间
    elapsed_offset: f64,
}

impl BudgetTracker {
    pub fn new(max_cost_units: u64, max_time_seconds: u64) -> Self {
        Self {
            max_cost_units,
            max_time_seconds,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            cost_used: 0,
            ledger: Vec::new(),
            warnings_issued: Vec::new(),
            started_at: Instant::now(),
            elapsed_offset: 0.0,
        }
    }

    pub fn with_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    pub fn cost_used(&self) -> u64 {
        self.cost_used
    }

    pub fn max_cost_units(&self) -> u64 {
        self.max_cost_units
    }

    /// 已消耗时间（秒）：墙钟 + 恢复偏移；单调不减
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_offset + self.started_at.elapsed().as_secs_f64()
    }

    /// 记录一步的开销：追加台账并累加计数器
    ///
    /// 对总量的影响与记录顺序无关（可交换）。
    pub fn record_step_cost(
        &mut self,
        step_id: u32,
        cost: u64,
        seconds: f64,
        description: impl Into<String>,
    ) {
        self.cost_used += cost;
        self.ledger.push(LedgerEntry {
            step_id,
            cost,
            seconds,
            description: description.into(),
            recorded_at: Utc::now(),
        });
    }

    /// 检查预算是否足以执行估算开销为 estimated_cost 的下一步
    pub fn check_budget(&mut self, estimated_cost: u64) -> BudgetCheck {
        let cost_remaining = self.max_cost_units.saturating_sub(self.cost_used);
        let elapsed = self.elapsed_seconds();
        let time_remaining = self.max_time_seconds as f64 - elapsed;

        let cost_used_fraction = if self.max_cost_units > 0 {
            self.cost_used as f64 / self.max_cost_units as f64
        } else {
            1.0
        };
        let time_used_fraction = if self.max_time_seconds > 0 {
            elapsed / self.max_time_seconds as f64
        } else {
            1.0
        };

        let can_proceed = cost_remaining >= estimated_cost && time_remaining > MIN_TIME_FLOOR_SECS;

        let warning = self.generate_warning(
            cost_remaining,
            time_remaining,
            estimated_cost,
            cost_used_fraction,
            time_used_fraction,
        );
        if let Some(ref w) = warning {
            self.warnings_issued.push(w.clone());
        }

        BudgetCheck {
            can_proceed,
            warning,
            cost_remaining,
            time_remaining,
            cost_used_fraction,
            time_used_fraction,
        }
    }

    /// 按严格优先级生成告警：估算不足 > 成本临界 > 时间临界 > 成本告警 > 时间告警
    fn generate_warning(
        &self,
        cost_remaining: u64,
        time_remaining: f64,
        estimated_cost: u64,
        cost_used_fraction: f64,
        time_used_fraction: f64,
    ) -> Option<BudgetWarning> {
        if cost_remaining < estimated_cost {
            return Some(BudgetWarning {
                level: WarnLevel::Critical,
                message: format!(
                    "insufficient cost budget: need {}, {} remaining",
                    estimated_cost, cost_remaining
                ),
                cost_remaining,
                time_remaining,
            });
        }

        if cost_used_fraction >= self.critical_threshold {
            return Some(BudgetWarning {
                level: WarnLevel::Critical,
                message: format!(
                    "cost budget critically low: {}/{} remaining",
                    cost_remaining, self.max_cost_units
                ),
                cost_remaining,
                time_remaining,
            });
        }

        if time_used_fraction >= self.critical_threshold {
            return Some(BudgetWarning {
                level: WarnLevel::Critical,
                message: format!("time budget critically low: {:.0}s remaining", time_remaining),
                cost_remaining,
                time_remaining,
            });
        }

        if cost_used_fraction >= self.warning_threshold {
            return Some(BudgetWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "cost budget low: {}/{} remaining ({:.1}% used)",
                    cost_remaining,
                    self.max_cost_units,
                    cost_used_fraction * 100.0
                ),
                cost_remaining,
                time_remaining,
            });
        }

        if time_used_fraction >= self.warning_threshold {
            return Some(BudgetWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "time budget low: {:.0}s remaining ({:.1}% used)",
                    time_remaining,
                    time_used_fraction * 100.0
                ),
                cost_remaining,
                time_remaining,
            });
        }

        None
    }

    /// 台账均值（无记录时为 None）
    pub fn average_step_cost(&self) -> Option<AverageStepCost> {
        if self.ledger.is_empty() {
            return None;
        }
        let count = self.ledger.len() as f64;
        Some(AverageStepCost {
            cost: self.ledger.iter().map(|e| e.cost).sum::<u64>() as f64 / count,
            seconds: self.ledger.iter().map(|e| e.seconds).sum::<f64>() / count,
        })
    }

    /// 估算还负担得起多少步：成本界与时间界取较小者
    pub fn estimate_remaining_steps(&self) -> Option<u64> {
        let avg = self.average_step_cost()?;
        if avg.cost <= 0.0 {
            return None;
        }
        let cost_remaining = self.max_cost_units.saturating_sub(self.cost_used) as f64;
        let time_remaining =
            (self.max_time_seconds as f64 - self.elapsed_seconds()).max(0.0);

        let by_cost = (cost_remaining / avg.cost) as u64;
        let by_time = if avg.seconds > 0.0 {
            (time_remaining / avg.seconds) as u64
        } else {
            u64::MAX
        };
        Some(by_cost.min(by_time))
    }

    pub fn ledger(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    /// 某一步骤在台账中的累计成本
    pub fn step_cost_total(&self, step_id: u32) -> u64 {
        self.ledger
            .iter()
            .filter(|e| e.step_id == step_id)
            .map(|e| e.cost)
            .sum()
    }

    pub fn warnings_issued(&self) -> &[BudgetWarning] {
        &self.warnings_issued
    }

    /// 文本形式的消耗总结（写入致命错误记录与任务报告）
    pub fn summary(&self) -> String {
        let elapsed = self.elapsed_seconds();
        let cost_percent = if self.max_cost_units > 0 {
            self.cost_used as f64 / self.max_cost_units as f64 * 100.0
        } else {
            100.0
        };
        let time_percent = if self.max_time_seconds > 0 {
            elapsed / self.max_time_seconds as f64 * 100.0
        } else {
            100.0
        };
        format!(
            "budget: cost {}/{} ({:.1}%), time {:.0}s/{}s ({:.1}%), {} steps recorded, {} warnings",
            self.cost_used,
            self.max_cost_units,
            cost_percent,
            elapsed,
            self.max_time_seconds,
            time_percent,
            self.ledger.len(),
            self.warnings_issued.len()
        )
    }

    /// 清零全部计数器与台账（新任务）；唯一允许计数器减小的操作
    pub fn reset(&mut self) {
        self.cost_used = 0;
        self.ledger.clear();
        self.warnings_issued.clear();
        self.started_at = Instant::now();
        self.elapsed_offset = 0.0;
    }

    /// 序列化当前状态（恢复任务时还原）
    pub fn serialize(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            max_cost_units: self.max_cost_units,
            max_time_seconds: self.max_time_seconds,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            cost_used: self.cost_used,
            elapsed_seconds: self.elapsed_seconds(),
            ledger: self.ledger.clone(),
        }
    }

    /// 从快照还原；已消耗时间作为偏移继续累计
    pub fn deserialize(snapshot: BudgetSnapshot) -> Self {
        Self {
            max_cost_units: snapshot.max_cost_units,
            max_time_seconds: snapshot.max_time_seconds,
            warning_threshold: snapshot.warning_threshold,
            critical_threshold: snapshot.critical_threshold,
            cost_used: snapshot.cost_used,
            ledger: snapshot.ledger,
            warnings_issued: Vec::new(),
            started_at: Instant::now(),
            elapsed_offset: snapshot.elapsed_seconds,
        }
    }
}
