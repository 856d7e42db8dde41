//! 运行时事件：供 CLI / 嵌入方订阅会话进展
//!
//! 通过可选的 unbounded mpsc 发送；无订阅者时循环不受影响。

use serde::Serialize;

/// 过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    SessionStart {
        session_id: String,
        request: String,
    },
    PhaseStart {
        phase: String,
        turn_budget: usize,
    },
    /// 正在调用 LLM 思考
    Thinking {
        phase: String,
    },
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具结果（预览，避免过长）
    ToolResult {
        tool: String,
        status: String,
        preview: String,
    },
    /// 权限门挂起等待批准
    ApprovalRequested {
        tool: String,
        phase: String,
    },
    /// 带通知调度（Notify 级别，或 auto_approve 模式下降级的 Approve）
    PermissionNotice {
        tool: String,
        level: String,
        mode: String,
    },
    /// 一次压缩完成
    Compaction {
        occupancy_before: f64,
        occupancy_after: f64,
        turns_dropped: usize,
    },
    PhaseCompleted {
        phase: String,
        turns_used: usize,
    },
    PhaseFailed {
        phase: String,
        reason: String,
    },
    /// 编排器的重路由决定（Mesh 失败回 Setup）
    Rerouted {
        from: String,
        to: String,
        attempt: usize,
    },
    /// Token 使用统计（阶段增量 + 累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        cumulative_prompt: u64,
        cumulative_completion: u64,
        cumulative_total: u64,
    },
    SessionEnd {
        session_id: String,
        status: String,
    },
    Error {
        text: String,
    },
}

/// 发送事件；无订阅者时静默丢弃
pub fn send_event(
    tx: &Option<&tokio::sync::mpsc::UnboundedSender<AgentEvent>>,
    ev: AgentEvent,
) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
