//! 核心层：错误类型、权限门、会话状态与阶段流水线编排

pub mod error;
pub mod orchestrator;
pub mod permissions;
pub mod session;

pub use error::AgentError;
pub use orchestrator::{create_orchestrator, Orchestrator};
pub use permissions::{
    effective, ApprovalDecision, ApprovalRequest, ApprovalResponder, GateAction, PermissionLevel,
    PermissionMode, StaticApprover,
};
pub use session::{
    new_session_id, PhaseRecord, PhaseStatus, SessionLog, SessionState, SessionStatus, StateManager,
};
