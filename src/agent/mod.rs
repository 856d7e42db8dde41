//! Agent 运行时：动作解析、事件流与阶段循环

pub mod action;
pub mod events;
pub mod loop_;

pub use action::{parse_action, ParsedAction, ToolCallEnvelope};
pub use events::{send_event, AgentEvent};
pub use loop_::{run_phase, PhaseOutcome, PhaseSession};
