//! 阶段合同：类型化载荷与边界校验
//!
//! 每个阶段的终端输出必须是对应的 JSON 载荷；extract_payload 从补全文本中取出 JSON
//! （```json 围栏或首个大括号块）并反序列化为封闭的 PhaseReport 变体。
//! 缺字段或类型错误产生带原因的 ContractViolation，由循环作为可恢复观察写回对话。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 五个阶段，按执行顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Consult,
    Setup,
    Mesh,
    Run,
    Analyze,
}

impl PhaseKind {
    /// 执行顺序
    pub const SEQUENCE: [PhaseKind; 5] = [
        PhaseKind::Consult,
        PhaseKind::Setup,
        PhaseKind::Mesh,
        PhaseKind::Run,
        PhaseKind::Analyze,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Consult => "consult",
            PhaseKind::Setup => "setup",
            PhaseKind::Mesh => "mesh",
            PhaseKind::Run => "run",
            PhaseKind::Analyze => "analyze",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 物理设定：类型键（决定求解器）、瞬态/湍流标记与湍流模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicsSpec {
    /// 如 incompressible_steady_turbulent、multiphase_vof
    #[serde(rename = "type")]
    pub kind: String,
    pub is_transient: bool,
    pub is_turbulent: bool,
    #[serde(default)]
    pub turbulence_model: Option<String>,
}

/// Consult 阶段载荷：需求澄清后的仿真规格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultReport {
    pub solver: String,
    pub physics: PhysicsSpec,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub tutorial_keywords: Vec<String>,
}

/// 文件改动类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Created,
    Edited,
    Deleted,
}

/// Setup 阶段记录的单条文件改动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileModification {
    pub path: String,
    pub action: FileAction,
    pub description: String,
}

/// Setup 阶段载荷：算例目录与改动清单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupReport {
    #[serde(default)]
    pub tutorial_source: Option<String>,
    pub case_dir: String,
    #[serde(default)]
    pub files_modified: Vec<FileModification>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

/// Mesh 阶段载荷：质量指标与是否通过
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshReport {
    pub passed: bool,
    #[serde(default)]
    pub cells: Option<u64>,
    #[serde(default)]
    pub max_non_orthogonality: Option<f64>,
    #[serde(default)]
    pub max_skewness: Option<f64>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Run 阶段载荷：收敛性与末段残差
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub converged: bool,
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub final_residuals: BTreeMap<String, f64>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Analyze 阶段载荷：结论、关键量与警告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeReport {
    pub summary: String,
    #[serde(default)]
    pub quantities: BTreeMap<String, f64>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// 封闭的阶段载荷集合：下游阶段只消费这些类型，不读对话原文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseReport {
    Consult(ConsultReport),
    Setup(SetupReport),
    Mesh(MeshReport),
    Run(RunReport),
    Analyze(AnalyzeReport),
}

impl PhaseReport {
    pub fn kind(&self) -> PhaseKind {
        match self {
            PhaseReport::Consult(_) => PhaseKind::Consult,
            PhaseReport::Setup(_) => PhaseKind::Setup,
            PhaseReport::Mesh(_) => PhaseKind::Mesh,
            PhaseReport::Run(_) => PhaseKind::Run,
            PhaseReport::Analyze(_) => PhaseKind::Analyze,
        }
    }
}

/// 合同校验失败：无载荷或形状错误
#[derive(Debug, Clone, PartialEq)]
pub enum ContractViolation {
    /// 终端文本中找不到任何 JSON 对象
    NoPayload,
    /// 找到 JSON 但不符合该阶段的字段要求
    Shape { reason: String },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::NoPayload => f.write_str("no JSON payload found in response"),
            ContractViolation::Shape { reason } => write!(f, "payload shape invalid: {reason}"),
        }
    }
}

/// 从补全文本中取出候选 JSON：优先 ```json 围栏，其次首个 { 到末个 }
pub fn extract_json_block(text: &str) -> Option<String> {
    let fenced = regex::Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").ok()?;
    if let Some(caps) = fenced.captures(text) {
        return Some(caps[1].to_string());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(text[start..=end].to_string())
    } else {
        None
    }
}

/// 校验终端文本并返回该阶段的类型化载荷
///
/// 未知多余键被忽略（领域协作方可扩展载荷）；缺必填字段或类型不符是 Shape 违规。
pub fn extract_payload(kind: PhaseKind, text: &str) -> Result<PhaseReport, ContractViolation> {
    let json = extract_json_block(text).ok_or(ContractViolation::NoPayload)?;
    let value: serde_json::Value = serde_json::from_str(&json).map_err(|e| {
        ContractViolation::Shape {
            reason: format!("invalid JSON: {e}"),
        }
    })?;

    let shape = |e: serde_json::Error| ContractViolation::Shape {
        reason: e.to_string(),
    };
    match kind {
        PhaseKind::Consult => serde_json::from_value::<ConsultReport>(value)
            .map(PhaseReport::Consult)
            .map_err(shape),
        PhaseKind::Setup => serde_json::from_value::<SetupReport>(value)
            .map(PhaseReport::Setup)
            .map_err(shape),
        PhaseKind::Mesh => serde_json::from_value::<MeshReport>(value)
            .map(PhaseReport::Mesh)
            .map_err(shape),
        PhaseKind::Run => serde_json::from_value::<RunReport>(value)
            .map(PhaseReport::Run)
            .map_err(shape),
        PhaseKind::Analyze => serde_json::from_value::<AnalyzeReport>(value)
            .map(PhaseReport::Analyze)
            .map_err(shape),
    }
}
