//! 权限门：静态级别 × 运行时模式
//!
//! 级别在工具注册时声明（Auto / Notify / Approve），模式来自配置
//! （standard / auto_approve / strict）。effective 是纯函数，决定一次调用是
//! 直接调度、带通知调度还是挂起等待批准。拒绝不是错误：调度记 rejected 结果，
//! 写回对话由模型改道。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具注册时声明的权限级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// 静默调度
    Auto,
    /// 调度并发通知事件
    Notify,
    /// 挂起循环等待批准
    Approve,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Auto => "auto",
            PermissionLevel::Notify => "notify",
            PermissionLevel::Approve => "approve",
        }
    }
}

/// 运行时权限模式（配置 [permissions].mode）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Standard,
    /// Approve 降为带通知调度；Notify 静默
    AutoApprove,
    /// Notify 升为需批准
    Strict,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Standard => "standard",
            PermissionMode::AutoApprove => "auto_approve",
            PermissionMode::Strict => "strict",
        }
    }
}

/// 一次工具调用的生效动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Dispatch,
    DispatchWithNotice,
    RequireApproval,
}

/// 模式 × 级别 -> 生效动作
pub fn effective(mode: PermissionMode, level: PermissionLevel) -> GateAction {
    match (mode, level) {
        (PermissionMode::Standard, PermissionLevel::Auto) => GateAction::Dispatch,
        (PermissionMode::Standard, PermissionLevel::Notify) => GateAction::DispatchWithNotice,
        (PermissionMode::Standard, PermissionLevel::Approve) => GateAction::RequireApproval,

        (PermissionMode::AutoApprove, PermissionLevel::Auto) => GateAction::Dispatch,
        (PermissionMode::AutoApprove, PermissionLevel::Notify) => GateAction::Dispatch,
        (PermissionMode::AutoApprove, PermissionLevel::Approve) => GateAction::DispatchWithNotice,

        (PermissionMode::Strict, PermissionLevel::Auto) => GateAction::Dispatch,
        (PermissionMode::Strict, PermissionLevel::Notify) => GateAction::RequireApproval,
        (PermissionMode::Strict, PermissionLevel::Approve) => GateAction::RequireApproval,
    }
}

/// 批准请求：工具名、参数与所在阶段
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub tool: String,
    pub args: Value,
    pub phase: String,
}

/// 批准决定；Deny 带原因，记入 rejected 结果并写回对话
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Deny { reason: String },
}

/// 批准方：循环在 RequireApproval 时挂起等待其答复（挂起点可被取消）
#[async_trait]
pub trait ApprovalResponder: Send + Sync {
    async fn respond(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// 固定答复的批准方：无人值守进程用
pub struct StaticApprover {
    decision: ApprovalDecision,
}

impl StaticApprover {
    pub fn allow_all() -> Self {
        Self {
            decision: ApprovalDecision::Allow,
        }
    }

    pub fn deny_all(reason: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Deny {
                reason: reason.into(),
            },
        }
    }
}

#[async_trait]
impl ApprovalResponder for StaticApprover {
    async fn respond(&self, _request: ApprovalRequest) -> ApprovalDecision {
        self.decision.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_mode_mapping() {
        assert_eq!(
            effective(PermissionMode::Standard, PermissionLevel::Auto),
            GateAction::Dispatch
        );
        assert_eq!(
            effective(PermissionMode::Standard, PermissionLevel::Notify),
            GateAction::DispatchWithNotice
        );
        assert_eq!(
            effective(PermissionMode::Standard, PermissionLevel::Approve),
            GateAction::RequireApproval
        );
    }

    #[test]
    fn auto_approve_demotes_approve_to_notice() {
        assert_eq!(
            effective(PermissionMode::AutoApprove, PermissionLevel::Approve),
            GateAction::DispatchWithNotice
        );
        assert_eq!(
            effective(PermissionMode::AutoApprove, PermissionLevel::Notify),
            GateAction::Dispatch
        );
        assert_eq!(
            effective(PermissionMode::AutoApprove, PermissionLevel::Auto),
            GateAction::Dispatch
        );
    }

    #[test]
    fn strict_promotes_notify() {
        assert_eq!(
            effective(PermissionMode::Strict, PermissionLevel::Notify),
            GateAction::RequireApproval
        );
        assert_eq!(
            effective(PermissionMode::Strict, PermissionLevel::Approve),
            GateAction::RequireApproval
        );
        // Auto 不受 strict 影响
        assert_eq!(
            effective(PermissionMode::Strict, PermissionLevel::Auto),
            GateAction::Dispatch
        );
    }

    #[tokio::test]
    async fn static_approver_answers() {
        let allow = StaticApprover::allow_all();
        let req = ApprovalRequest {
            tool: "write_file".to_string(),
            args: serde_json::json!({"path": "0/U"}),
            phase: "setup".to_string(),
        };
        assert_eq!(allow.respond(req.clone()).await, ApprovalDecision::Allow);

        let deny = StaticApprover::deny_all("operator policy");
        match deny.respond(req).await {
            ApprovalDecision::Deny { reason } => assert_eq!(reason, "operator policy"),
            other => panic!("expected deny, got {other:?}"),
        }
    }
}
