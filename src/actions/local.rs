//! 本地动作执行器
//!
//! ActionExecutor 的参考适配器：文件动作限制在沙箱根目录内，
//! 命令动作仅放行白名单中的命令首词。网络抓取不在本执行器能力内。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::actions::{ActionExecutor, ActionRequest};

/// 结果截断上限，避免把超长输出整段塞回提示词
const MAX_RESULT_CHARS: usize = 8000;

/// 沙箱化的本地执行器
pub struct LocalActionExecutor {
    workspace_root: PathBuf,
    allowed_commands: Vec<String>,
}

impl LocalActionExecutor {
    pub fn new(workspace_root: impl AsRef<Path>, allowed_commands: Vec<String>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            allowed_commands,
        }
    }

    /// 将相对路径解析到沙箱内；含 .. 或绝对路径一律拒绝
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Err(format!("absolute path not allowed: {}", path));
        }
        for component in candidate.components() {
            if matches!(component, Component::ParentDir) {
                return Err(format!("path escape attempt: {}", path));
            }
        }
        Ok(self.workspace_root.join(candidate))
    }

    fn command_allowed(&self, command: &str) -> bool {
        command
            .split_whitespace()
            .next()
            .map(|head| self.allowed_commands.iter().any(|c| c == head))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ActionExecutor for LocalActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<String, String> {
        match request {
            ActionRequest::ReadFile { path } => {
                let resolved = self.resolve(path)?;
                let content = tokio::fs::read_to_string(&resolved)
                    .await
                    .map_err(|e| format!("read {}: {}", path, e))?;
                Ok(truncate(content))
            }
            ActionRequest::WriteFile { path, content } => {
                let resolved = self.resolve(path)?;
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| format!("mkdir for {}: {}", path, e))?;
                }
                tokio::fs::write(&resolved, content)
                    .await
                    .map_err(|e| format!("write {}: {}", path, e))?;
                Ok(format!("wrote {} bytes to {}", content.len(), path))
            }
            ActionRequest::ListFiles { path } => {
                let resolved = self.resolve(path)?;
                let mut entries = tokio::fs::read_dir(&resolved)
                    .await
                    .map_err(|e| format!("list {}: {}", path, e))?;
                let mut names = Vec::new();
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| format!("list {}: {}", path, e))?
                {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.path().is_dir() {
                        name.push('/');
                    }
                    names.push(name);
                }
                names.sort();
                Ok(names.join("\n"))
            }
            ActionRequest::RunCommand { command } => {
                if !self.command_allowed(command) {
                    return Err(format!("command not in allowlist: {}", command));
                }
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(&self.workspace_root)
                    .output()
                    .await
                    .map_err(|e| format!("spawn {}: {}", command, e))?;
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if output.status.success() {
                    Ok(truncate(if stdout.is_empty() { stderr } else { stdout }))
                } else {
                    Err(format!(
                        "command failed ({}): {}",
                        output.status,
                        truncate(if stderr.is_empty() { stdout } else { stderr })
                    ))
                }
            }
            ActionRequest::FetchUrl { url } => {
                Err(format!("fetch_url is not available in the local executor: {}", url))
            }
        }
    }
}

fn truncate(text: String) -> String {
    if text.chars().count() > MAX_RESULT_CHARS {
        let cut: String = text.chars().take(MAX_RESULT_CHARS).collect();
        format!("{}...\n[truncated]", cut)
    } else {
        text
    }
}
