//! 各阶段提示词
//!
//! system prompt = 阶段指令 + 版本上下文 + 工具清单 + 动作协议；任务提示词注入用户
//! 请求与前序阶段的已校验载荷（紧凑 JSON），从不携带前序对话原文。

use crate::contract::{ConsultReport, MeshReport, PhaseKind, RunReport, SetupReport};
use crate::tools::{tool_call_schema_json, ToolRegistry};
use crate::version::VersionProfile;

/// 动作协议：每轮一个动作，工具信封或终端载荷
const ACTION_PROTOCOL: &str = "\
## How to act
Take exactly one action per turn.
- To call a tool, reply with a single JSON object: {\"tool\": \"<name>\", \"args\": {...}}
- To finish the phase, reply with the final JSON payload described above (no \"tool\" key).
Never mix prose and the final payload outside a single JSON block.";

const CONSULT_INSTRUCTIONS: &str = "\
You are the consultation engineer of a CFD automation pipeline. Translate the
user's request into a simulation specification. Prefer asking the tutorial
index over guessing. State every assumption you make.

Finish with a JSON payload of this shape:
{
  \"solver\": \"<solver binary for this physics>\",
  \"physics\": {
    \"type\": \"<physics key, e.g. incompressible_steady_turbulent>\",
    \"is_transient\": false,
    \"is_turbulent\": true,
    \"turbulence_model\": \"kOmegaSST\"
  },
  \"assumptions\": [\"...\"],
  \"tutorial_keywords\": [\"...\"]
}";

const SETUP_INSTRUCTIONS: &str = "\
You are the case setup engineer. Start from the closest tutorial (template
first, never write a case from scratch), copy it into the case directory and
adapt boundary conditions, transport properties and control settings to the
specification. Record every file you touch.

Finish with a JSON payload of this shape:
{
  \"tutorial_source\": \"<tutorial path or null>\",
  \"case_dir\": \"<case directory>\",
  \"files_modified\": [
    {\"path\": \"0/U\", \"action\": \"edited\", \"description\": \"inlet velocity\"}
  ],
  \"assumptions\": [\"...\"]
}";

const MESH_INSTRUCTIONS: &str = "\
You are the meshing engineer. Generate the mesh (blockMesh unless the case
provides another route) and judge quality with checkMesh. Quality gates:
max non-orthogonality below 70, max skewness below 4, aspect ratio below 100.
A mesh failing the gates must be reported as passed=false with the issues.

Finish with a JSON payload of this shape:
{
  \"passed\": true,
  \"cells\": 12000,
  \"max_non_orthogonality\": 55.0,
  \"max_skewness\": 1.9,
  \"issues\": []
}";

const RUN_INSTRUCTIONS: &str = "\
You are the solver engineer. Launch the configured solver, watch residuals and
iteration progress, and judge convergence. For steady cases require final
residuals below 1e-4; for transient cases require stable Courant number and a
completed end time. Report honestly: a diverged or stalled run is
converged=false with the evidence in issues.

Finish with a JSON payload of this shape:
{
  \"converged\": true,
  \"iterations\": 850,
  \"final_residuals\": {\"p\": 5.0e-5, \"Ux\": 2.0e-5},
  \"issues\": []
}";

const ANALYZE_INSTRUCTIONS: &str = "\
You are the post-processing engineer. Extract the quantities the user asked
for, sample fields where needed, and summarise the result for an engineer who
has not seen the transcript. Flag anything suspicious in warnings.

Finish with a JSON payload of this shape:
{
  \"summary\": \"...\",
  \"quantities\": {\"pressure_drop_pa\": 104.2},
  \"warnings\": []
}";

fn instructions(kind: PhaseKind) -> &'static str {
    match kind {
        PhaseKind::Consult => CONSULT_INSTRUCTIONS,
        PhaseKind::Setup => SETUP_INSTRUCTIONS,
        PhaseKind::Mesh => MESH_INSTRUCTIONS,
        PhaseKind::Run => RUN_INSTRUCTIONS,
        PhaseKind::Analyze => ANALYZE_INSTRUCTIONS,
    }
}

fn tools_block(registry: &ToolRegistry, allowed: &[String]) -> String {
    let mut out = String::from("## Available tools\n");
    let mut listed = false;
    for (name, desc) in registry.tool_descriptions() {
        if allowed.iter().any(|a| a == &name) {
            out.push_str(&format!("- {name}: {desc}\n"));
            listed = true;
        }
    }
    if !listed {
        out.push_str("(none)\n");
    }
    out
}

/// 拼装某阶段的 system prompt
pub fn system_prompt(
    kind: PhaseKind,
    profile: &VersionProfile,
    registry: &ToolRegistry,
    allowed: &[String],
) -> String {
    format!(
        "{}\n\n{}\n{}\n{}\n\nTool call format (JSON Schema):\n{}",
        instructions(kind),
        profile.prompt_context(),
        tools_block(registry, allowed),
        ACTION_PROTOCOL,
        tool_call_schema_json()
    )
}

fn compact_json<T: serde::Serialize>(label: &str, value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(js) => format!("{label}:\n{js}\n\n"),
        Err(_) => String::new(),
    }
}

pub fn consult_task(request: &str) -> String {
    format!("User request:\n{request}\n\nProduce the simulation specification.")
}

pub fn setup_task(
    request: &str,
    consult: &ConsultReport,
    mesh_feedback: Option<&str>,
) -> String {
    let mut out = format!("User request:\n{request}\n\n");
    out.push_str(&compact_json("Validated simulation specification", consult));
    if let Some(detail) = mesh_feedback {
        out.push_str(&format!(
            "Previous mesh attempt failed:\n{detail}\n\nRevisit the case setup and fix the cause before finishing.\n\n"
        ));
    }
    out.push_str("Set up the case from the closest tutorial.");
    out
}

pub fn mesh_task(consult: &ConsultReport, setup: &SetupReport) -> String {
    let mut out = String::new();
    out.push_str(&compact_json("Simulation specification", consult));
    out.push_str(&compact_json("Case setup report", setup));
    out.push_str("Generate and check the mesh for this case.");
    out
}

pub fn run_task(consult: &ConsultReport, setup: &SetupReport, mesh: &MeshReport) -> String {
    let mut out = String::new();
    out.push_str(&compact_json("Simulation specification", consult));
    out.push_str(&compact_json("Case setup report", setup));
    out.push_str(&compact_json("Mesh report", mesh));
    out.push_str("Run the solver and judge convergence.");
    out
}

pub fn analyze_task(
    request: &str,
    consult: &ConsultReport,
    setup: &SetupReport,
    run: &RunReport,
) -> String {
    let mut out = format!("User request:\n{request}\n\n");
    out.push_str(&compact_json("Simulation specification", consult));
    out.push_str(&compact_json("Case setup report", setup));
    out.push_str(&compact_json("Run report", run));
    out.push_str("Post-process the results and answer the user's question.");
    out
}
