//! Agent 错误类型
//!
//! 区分阶段级失败（轮次预算、连续工具失败、上下文压缩失效）与会话级失败（配置、取消、IO），
//! Orchestrator 据此决定重路由（Mesh -> Setup）还是终止会话。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（LLM、解析、合同校验、上下文、取消等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// 阶段终端输出未通过合同校验（仅当循环无法再恢复时向上传播）
    #[error("Contract violation in phase {phase}: {reason}")]
    ContractViolation { phase: String, reason: String },

    /// 压缩后占用未严格下降，或固定区自身已超过阈值
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("Turn budget exhausted: phase {phase} used all {budget} turns")]
    TurnBudgetExhausted { phase: String, budget: usize },

    #[error("Tool failure limit exceeded: {limit} consecutive failures in phase {phase}")]
    ToolFailureLimit { phase: String, limit: usize },

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("State persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::JsonParse(e.to_string())
    }
}
