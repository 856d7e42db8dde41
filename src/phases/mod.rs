//! 阶段规格
//!
//! 每个阶段一份静态规格：system prompt、任务提示词、工具子集与轮次预算。
//! 工具子集按名过滤注册表，阶段只能看见并调用自己子集内的工具。

pub mod prompts;

use crate::config::PhaseTurnsSection;
use crate::contract::{ConsultReport, MeshReport, PhaseKind, RunReport, SetupReport};
use crate::tools::ToolRegistry;
use crate::version::VersionProfile;

/// 一个阶段的完整运行规格
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub kind: PhaseKind,
    pub system_prompt: String,
    pub task_prompt: String,
    pub allowed_tools: Vec<String>,
    pub turn_budget: usize,
}

/// 各阶段的工具子集（注册表里没有的名字会在调度时得到 unknown_tool 结果）
pub fn allowed_tools(kind: PhaseKind) -> Vec<String> {
    let names: &[&str] = match kind {
        PhaseKind::Consult => &["search_tutorials"],
        PhaseKind::Setup => &[
            "search_tutorials",
            "copy_tutorial",
            "read_file",
            "write_file",
            "list_files",
        ],
        PhaseKind::Mesh => &["run_command", "read_file", "write_file", "list_files"],
        PhaseKind::Run => &["run_command", "read_file", "write_file", "list_files"],
        PhaseKind::Analyze => &["run_command", "read_file", "write_file", "list_files"],
    };
    names.iter().map(|s| s.to_string()).collect()
}

/// 阶段轮次预算（配置 [limits.phase_turns]）
pub fn turn_budget(kind: PhaseKind, budgets: &PhaseTurnsSection) -> usize {
    match kind {
        PhaseKind::Consult => budgets.consult,
        PhaseKind::Setup => budgets.setup,
        PhaseKind::Mesh => budgets.mesh,
        PhaseKind::Run => budgets.run,
        PhaseKind::Analyze => budgets.analyze,
    }
}

/// 前序阶段的已校验载荷；任务提示词只从这里取信息
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorReports<'a> {
    pub consult: Option<&'a ConsultReport>,
    pub setup: Option<&'a SetupReport>,
    pub mesh: Option<&'a MeshReport>,
    pub run: Option<&'a RunReport>,
}

/// 构建阶段规格；缺少前序载荷说明编排器时序有错，属于编程错误
pub fn build_phase_spec(
    kind: PhaseKind,
    request: &str,
    prior: &PriorReports<'_>,
    profile: &VersionProfile,
    budgets: &PhaseTurnsSection,
    registry: &ToolRegistry,
    mesh_feedback: Option<&str>,
) -> Option<PhaseSpec> {
    let allowed = allowed_tools(kind);
    let system_prompt = prompts::system_prompt(kind, profile, registry, &allowed);
    let task_prompt = match kind {
        PhaseKind::Consult => prompts::consult_task(request),
        PhaseKind::Setup => prompts::setup_task(request, prior.consult?, mesh_feedback),
        PhaseKind::Mesh => prompts::mesh_task(prior.consult?, prior.setup?),
        PhaseKind::Run => prompts::run_task(prior.consult?, prior.setup?, prior.mesh?),
        PhaseKind::Analyze => {
            prompts::analyze_task(request, prior.consult?, prior.setup?, prior.run?)
        }
    };
    Some(PhaseSpec {
        kind,
        system_prompt,
        task_prompt,
        allowed_tools: allowed,
        turn_budget: turn_budget(kind, budgets),
    })
}
