//! 工具调用 JSON Schema 生成
//!
//! 把「合法 tool call」的 JSON 结构注入各阶段 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 工具调用信封格式：与动作解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，须在本阶段工具子集内
    pub tool: String,
    /// 工具参数，形状由各工具的 parameters schema 决定
    pub args: serde_json::Value,
}

/// 返回工具调用信封的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
