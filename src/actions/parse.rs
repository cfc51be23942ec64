//! 自由文本动作提取
//!
//! 推理协作方的输出是散文混排的，按顺序尝试三种提取策略直到成功：
//! 1. `ACTION:` 标记后的花括号平衡对象
//! 2. ```json 围栏块
//! 3. 文本中第一个含 "action" 字段的花括号平衡对象
//! 解析前先做轻度修复（去掉收尾分隔符、补齐未闭合括号），仍失败才放弃。

use crate::actions::ActionRequest;
use crate::core::AgentError;

/// 显式动作标记
const ACTION_MARKER: &str = "ACTION:";

/// 从自由文本提取动作请求；所有策略都失败时返回 ActionParse
pub fn extract_action(text: &str) -> Result<ActionRequest, AgentError> {
    let candidates = [
        marker_payload(text),
        fenced_payload(text),
        embedded_payload(text),
    ];

    for candidate in candidates.into_iter().flatten() {
        let repaired = repair_json(&candidate);
        if let Ok(request) = serde_json::from_str::<ActionRequest>(&repaired) {
            return Ok(request);
        }
    }

    Err(AgentError::ActionParse(format!(
        "no action request found in response: {}",
        preview(text)
    )))
}

/// 策略 1：ACTION: 标记后的对象；找不到平衡闭合时取到文本末尾（交给修复补闭合）
fn marker_payload(text: &str) -> Option<String> {
    let marker_at = text.find(ACTION_MARKER)?;
    let after = &text[marker_at + ACTION_MARKER.len()..];
    let brace_at = after.find('{')?;
    let from_brace = &after[brace_at..];
    match balanced_payload(from_brace) {
        Some(payload) => Some(payload),
        None => Some(from_brace.trim().to_string()),
    }
}

/// 策略 2：```json 围栏块（或内容以 { / [ 开头的无标签围栏块）
fn fenced_payload(text: &str) -> Option<String> {
    let content = if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        let start = text.find("```")?;
        let rest = &text[start + 3..];
        let body = match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        };
        if body.starts_with('{') || body.starts_with('[') {
            body
        } else {
            return None;
        }
    };
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

/// 策略 3：第一个含 "action" 字段的平衡对象
fn embedded_payload(text: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        match balanced_payload(&text[start..]) {
            Some(payload) => {
                if payload.contains("\"action\"") {
                    return Some(payload);
                }
                search_from = start + 1;
            }
            None => return None,
        }
    }
    None
}

/// 计划/反思响应共用的宽松提取：围栏块优先，其次首个平衡对象或数组，最后整段文本
pub(crate) fn extract_json_payload(text: &str) -> Option<String> {
    if let Some(fenced) = fenced_payload(text) {
        return Some(fenced);
    }

    let object_at = text.find('{');
    let array_at = text.find('[');
    let start = match (object_at, array_at) {
        (Some(o), Some(a)) => Some(o.min(a)),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };
    if let Some(start) = start {
        if let Some(payload) = balanced_payload(&text[start..]) {
            return Some(payload);
        }
        // 未闭合：取剩余部分交给修复
        return Some(repair_json(text[start..].trim()));
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// 从 { 或 [ 起扫描到对应的平衡闭合；嵌套计数不感知字符串字面量，
/// 与上游的宽松约定一致（字段值里出现裸括号的响应按解析失败处理）
fn balanced_payload(text: &str) -> Option<String> {
    let mut chars = text.char_indices();
    let (open, close) = match text.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (i, c) in &mut chars {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(text[..=i].to_string());
            }
        }
    }
    None
}

/// 轻度修复：去掉闭合括号前的尾随分隔符，补齐未闭合的括号
pub(crate) fn repair_json(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in payload.trim().chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                strip_trailing_separator(&mut out);
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    // 补齐未闭合的括号（字符串未闭合时先补引号）
    if in_string {
        out.push('"');
    }
    while let Some(close) = stack.pop() {
        strip_trailing_separator(&mut out);
        out.push(close);
    }
    out
}

/// 丢弃 out 末尾的「逗号 + 空白」，用于闭合括号前
fn strip_trailing_separator(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
}

fn preview(text: &str) -> String {
    let flat: String = text.chars().take(120).collect();
    if text.len() > 120 {
        format!("{}...", flat)
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_format() {
        let response = r#"
I will read the file first.

ACTION:
{
  "action": "read_file",
  "path": "notes.txt"
}
"#;
        let request = extract_action(response).unwrap();
        assert_eq!(
            request,
            ActionRequest::ReadFile {
                path: "notes.txt".to_string()
            }
        );
    }

    #[test]
    fn test_fenced_block() {
        let response = "```json\n{\"action\": \"list_files\", \"path\": \".\"}\n```";
        let request = extract_action(response).unwrap();
        assert_eq!(request.name(), "list_files");
    }

    #[test]
    fn test_fenced_block_without_language_tag() {
        let response = "```\n{\"action\": \"run_command\", \"command\": \"ls -la\"}\n```";
        let request = extract_action(response).unwrap();
        assert_eq!(request.name(), "run_command");
    }

    #[test]
    fn test_embedded_object_in_prose() {
        let response = r#"
Some explanation here.

{"action": "write_file", "path": "new.txt", "content": "hello"}

More text here.
"#;
        let request = extract_action(response).unwrap();
        assert_eq!(request.name(), "write_file");
    }

    #[test]
    fn test_embedded_skips_objects_without_action_field() {
        let response = r#"{"note": "irrelevant"} and then {"action": "list_files", "path": "src"}"#;
        let request = extract_action(response).unwrap();
        assert_eq!(
            request,
            ActionRequest::ListFiles {
                path: "src".to_string()
            }
        );
    }

    #[test]
    fn test_plain_text_returns_parse_error() {
        let err = extract_action("Just plain text without any JSON").unwrap_err();
        assert!(matches!(err, AgentError::ActionParse(_)));
    }

    #[test]
    fn test_trailing_comma_is_repaired() {
        let response = r#"ACTION: {"action": "read_file", "path": "x.txt",}"#;
        let request = extract_action(response).unwrap();
        assert_eq!(request.name(), "read_file");
    }

    #[test]
    fn test_unclosed_object_is_auto_closed() {
        let response = r#"ACTION: {"action": "list_files", "path": "src""#;
        let request = extract_action(response).unwrap();
        assert_eq!(
            request,
            ActionRequest::ListFiles {
                path: "src".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_action_is_rejected_not_guessed() {
        let err = extract_action(r#"{"action": "teleport", "where": "home"}"#).unwrap_err();
        assert!(matches!(err, AgentError::ActionParse(_)));
    }

    #[test]
    fn test_repair_strips_separator_before_nested_close() {
        let repaired = repair_json(r#"{"steps": [{"id": 1,}, ], }"#);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["steps"][0]["id"], 1);
    }

    #[test]
    fn test_extract_json_payload_prefers_fence() {
        let text = "noise {\"decoy\": 1}\n```json\n{\"steps\": []}\n```";
        let payload = extract_json_payload(text).unwrap();
        assert!(payload.contains("steps"));
    }

    #[test]
    fn test_extract_json_payload_bare_array() {
        let payload = extract_json_payload(r#"[{"id": 1, "description": "a"}]"#).unwrap();
        assert!(payload.starts_with('['));
    }
}
