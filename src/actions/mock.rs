//! Mock 动作执行器（测试与离线演示用）
//!
//! 按动作名返回预置结果，可指定失败集合并记录全部调用。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::actions::{ActionExecutor, ActionRequest};

/// Mock 执行器：预置结果 + 可变失败集合 + 调用记录
#[derive(Debug, Default)]
pub struct MockActionExecutor {
    results: HashMap<String, String>,
    fail_on: Mutex<HashSet<String>>,
    fail_once: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ActionRequest>>,
}

impl MockActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为指定动作名预置结果
    pub fn with_result(mut self, action: &str, result: &str) -> Self {
        self.results.insert(action.to_string(), result.to_string());
        self
    }

    /// 让指定动作名失败
    pub fn with_failure(self, action: &str) -> Self {
        self.fail_on.lock().unwrap().insert(action.to_string());
        self
    }

    /// 让指定动作名只失败一次（模拟瞬时错误）
    pub fn with_failure_once(self, action: &str) -> Self {
        self.fail_once.lock().unwrap().insert(action.to_string());
        self
    }

    /// 运行中途清除失败集合（模拟「重试后成功」）
    pub fn clear_failures(&self) {
        self.fail_on.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<ActionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ActionExecutor for MockActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<String, String> {
        self.calls.lock().unwrap().push(request.clone());

        if self.fail_once.lock().unwrap().remove(request.name()) {
            return Err(format!("mock transient failure: {}", request.name()));
        }
        if self.fail_on.lock().unwrap().contains(request.name()) {
            return Err(format!("mock action failure: {}", request.name()));
        }

        Ok(self
            .results
            .get(request.name())
            .cloned()
            .unwrap_or_else(|| format!("mock result for {}", request.name())))
    }
}
