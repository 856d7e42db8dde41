//! foampilot - CFD 仿真流程编排智能体
//!
//! 模块划分：
//! - **agent**: 阶段 Agent 循环（动作解析、事件流、主循环）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 阶段对话上下文、Token 估算与压缩
//! - **contract**: 阶段载荷类型与合同校验
//! - **core**: 错误类型、权限门、会话状态、阶段流水线编排
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **phases**: 阶段规格（提示词、工具子集、轮次预算）
//! - **tools**: 工具 trait、注册表与调度器
//! - **version**: OpenFOAM 版本画像（求解器映射、版本差异）

pub mod agent;
pub mod config;
pub mod context;
pub mod contract;
pub mod core;
pub mod llm;
pub mod phases;
pub mod tools;
pub mod version;
