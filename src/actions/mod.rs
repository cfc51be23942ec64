//! 动作层：请求类型、执行器抽象与自由文本提取
//!
//! ActionRequest 是封闭的标签联合体，每个动作种类携带类型化参数并在
//! 反序列化时校验——未知或缺参的动作在解析阶段就失败，而不是调用时。
//! 动作的实际执行属于外部协作方，核心只依赖 ActionExecutor trait。

pub mod local;
pub mod mock;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::LocalActionExecutor;
pub use mock::MockActionExecutor;
pub use parse::extract_action;

/// 支持的动作种类（封闭集合）
///
/// 线格式：{"action": "read_file", "path": "..."}；serde 按 action 标签分发。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ListFiles {
        #[serde(default = "default_list_path")]
        path: String,
    },
    RunCommand {
        command: String,
    },
    FetchUrl {
        url: String,
    },
}

fn default_list_path() -> String {
    ".".to_string()
}

impl ActionRequest {
    /// 动作名（与线格式的 action 标签一致）
    pub fn name(&self) -> &'static str {
        match self {
            ActionRequest::ReadFile { .. } => "read_file",
            ActionRequest::WriteFile { .. } => "write_file",
            ActionRequest::ListFiles { .. } => "list_files",
            ActionRequest::RunCommand { .. } => "run_command",
            ActionRequest::FetchUrl { .. } => "fetch_url",
        }
    }

    /// 单行描述（日志与步骤结果用）
    pub fn describe(&self) -> String {
        match self {
            ActionRequest::ReadFile { path } => format!("read_file {}", path),
            ActionRequest::WriteFile { path, .. } => format!("write_file {}", path),
            ActionRequest::ListFiles { path } => format!("list_files {}", path),
            ActionRequest::RunCommand { command } => format!("run_command {}", command),
            ActionRequest::FetchUrl { url } => format!("fetch_url {}", url),
        }
    }
}

/// 动作执行协作方抽象：执行一个动作请求，返回结果文本或失败原因
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<String, String>;
}

/// 提示词中展示给推理协作方的动作清单
pub fn action_catalog() -> &'static str {
    r#"- {"action": "read_file", "path": "<file>"}: read a file's content
- {"action": "write_file", "path": "<file>", "content": "<text>"}: create or overwrite a file
- {"action": "list_files", "path": "<dir>"}: list a directory
- {"action": "run_command", "command": "<cmd>"}: run an allowlisted shell command
- {"action": "fetch_url", "url": "<url>"}: fetch a URL"#
}
