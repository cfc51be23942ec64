//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HORNET__*` 覆盖（双下划线表示嵌套，如 `HORNET__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub mission: MissionSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub actions: ActionsSection,
    #[serde(default)]
    pub recovery: RecoverySection,
}

/// [app] 段：应用名、会话快照目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话快照目录，未设置时用 ./sessions
    pub sessions_dir: Option<PathBuf>,
}

/// [mission] 段：计划规模、循环与重试上限
#[derive(Debug, Clone, Deserialize)]
pub struct MissionSection {
    /// 单个计划的最大步数
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    /// 主控循环迭代上限（防止状态机死循环）
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// 单步失败后的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for MissionSection {
    fn default() -> Self {
        Self {
            max_plan_steps: default_max_plan_steps(),
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_plan_steps() -> usize {
    10
}

fn default_max_iterations() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

/// [budget] 段：成本与时间上限、告警阈值
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_max_cost_units")]
    pub max_cost_units: u64,
    #[serde(default = "default_max_time_seconds")]
    pub max_time_seconds: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            max_cost_units: default_max_cost_units(),
            max_time_seconds: default_max_time_seconds(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

fn default_max_cost_units() -> u64 {
    100_000
}

fn default_max_time_seconds() -> u64 {
    3600
}

fn default_warning_threshold() -> f64 {
    0.8
}

fn default_critical_threshold() -> f64 {
    0.95
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：openai 兼容端点或 mock；无 API Key 时自动退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [actions] 段：本地执行器的沙箱根与命令白名单
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ActionsSection {
    /// 文件动作的沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 允许执行的命令名（仅首词，如 ls、grep、cargo）
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "cargo".into(),
        "rustc".into(),
    ]
}

/// [recovery] 段：终态会话的保留天数
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    7
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            mission: MissionSection::default(),
            budget: BudgetSection::default(),
            llm: LlmSection::default(),
            actions: ActionsSection::default(),
            recovery: RecoverySection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HORNET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HORNET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HORNET")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
