//! 补全文本的动作解析
//!
//! 模型用 JSON 信封表达工具调用：{"tool": "name", "args": {...}}。含该信封的补全
//! 解析为 ToolCall；其余文本（包括阶段载荷 JSON）都是终端动作，交给合同校验。
//! 形似信封但解析失败的输出单独标记，循环将其作为可恢复反馈写回。

use serde::{Deserialize, Serialize};

use crate::contract::extract_json_block;

/// LLM 返回的 Tool Call（简化 JSON：{"tool": "read_file", "args": {"path": "..."}}）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 解析结果
#[derive(Debug, Clone)]
pub enum ParsedAction {
    ToolCall(ToolCallEnvelope),
    /// 终端文本（可能含阶段载荷）
    Terminal(String),
    /// 形似工具信封但无法解析；原因写回对话
    Malformed(String),
}

/// 解析 LLM 输出：提取 JSON 候选，按是否带 "tool" 键分流
pub fn parse_action(output: &str) -> ParsedAction {
    let trimmed = output.trim();
    let Some(json) = extract_json_block(trimmed) else {
        return ParsedAction::Terminal(trimmed.to_string());
    };

    match serde_json::from_str::<serde_json::Value>(&json) {
        Ok(value) => {
            let has_tool_key = value.get("tool").is_some();
            if !has_tool_key {
                return ParsedAction::Terminal(trimmed.to_string());
            }
            match serde_json::from_value::<ToolCallEnvelope>(value) {
                Ok(env) if env.tool.is_empty() => ParsedAction::Terminal(trimmed.to_string()),
                Ok(mut env) => {
                    if env.args.is_null() {
                        env.args = serde_json::json!({});
                    }
                    ParsedAction::ToolCall(env)
                }
                Err(e) => ParsedAction::Malformed(format!("malformed tool call envelope: {e}")),
            }
        }
        Err(e) => {
            // 无法解析的 JSON：带 "tool" 字样按坏信封处理，否则按终端文本
            if json.contains("\"tool\"") {
                ParsedAction::Malformed(format!("invalid JSON in tool call: {e}"))
            } else {
                ParsedAction::Terminal(trimmed.to_string())
            }
        }
    }
}
