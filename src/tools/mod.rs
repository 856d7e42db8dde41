//! 工具层：trait、注册表、调度器与调用格式 Schema

pub mod dispatcher;
pub mod echo;
pub mod registry;
pub mod schema;

pub use dispatcher::{OutcomeStatus, ToolDispatcher, ToolOutcome};
pub use echo::EchoTool;
pub use registry::{Tool, ToolRegistry};
pub use schema::tool_call_schema_json;
