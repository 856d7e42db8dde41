//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / permission_level / execute），
//! 由 ToolRegistry 按名注册与查找；权限级别在注册时静态声明，运行时只由权限门解释。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::permissions::PermissionLevel;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、权限级别、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（调度前用于校验参数；不通过则处理器不会被调用）
    /// 默认返回空对象 schema，表示无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 注册时声明的权限级别；运行时模式可升降其生效行为
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Auto
    }

    /// 执行工具；失败用 Err 表达，处理器不向运行时抛 panic
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，支持 register / get / tool_names
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// 查工具的权限级别；未注册的名字返回 None
    pub fn permission_level(&self, name: &str) -> Option<PermissionLevel> {
        self.tools.get(name).map(|t| t.permission_level())
    }
}
