//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FOAMPILOT__*` 覆盖（双下划线表示嵌套，
//! 如 `FOAMPILOT__PERMISSIONS__MODE=auto_approve`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::permissions::PermissionMode;
use crate::core::AgentError;
use crate::version;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub permissions: PermissionsSection,
    #[serde(default)]
    pub openfoam: OpenFoamSection,
}

/// [app] 段：算例根目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 会话目录的根，未设置时用 ./cases
    pub cases_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择、模型与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai 兼容端点 / mock
    pub provider: String,
    pub model: String,
    /// 压缩摘要等重任务使用的模型；未设置时回退到 model
    pub model_complex: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    /// 传输类错误（超时、连接）的最大重试次数
    pub max_retries: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            model_complex: None,
            base_url: None,
            request_timeout_secs: 120,
            max_retries: 2,
        }
    }
}

/// [limits] 段：轮次预算、失败上限、上下文窗口与压缩阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// 单阶段轮次上限的全局兜底（phase_turns 未覆盖的阶段用它）
    pub max_turns: usize,
    /// 连续工具/合同失败达到该值则阶段失败
    pub tool_failure_limit: usize,
    /// 占用比达到该值时在下一次请求前压缩
    pub compaction_threshold: f64,
    pub context_window_tokens: usize,
    /// 压缩永不触及的最近轮数
    pub keep_recent_turns: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 工具结果写入观察的最大字符数
    pub max_result_chars: usize,
    #[serde(default)]
    pub phase_turns: PhaseTurnsSection,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_turns: 100,
            tool_failure_limit: 3,
            compaction_threshold: 0.70,
            context_window_tokens: 200_000,
            keep_recent_turns: 2,
            tool_timeout_secs: 120,
            max_result_chars: 8000,
            phase_turns: PhaseTurnsSection::default(),
        }
    }
}

/// [limits.phase_turns] 段：各阶段轮次预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhaseTurnsSection {
    pub consult: usize,
    pub setup: usize,
    pub mesh: usize,
    pub run: usize,
    pub analyze: usize,
}

impl Default for PhaseTurnsSection {
    fn default() -> Self {
        Self {
            consult: 10,
            setup: 30,
            mesh: 20,
            run: 20,
            analyze: 20,
        }
    }
}

/// [permissions] 段：运行时权限模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    /// standard / auto_approve / strict
    pub mode: String,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            mode: "standard".to_string(),
        }
    }
}

impl PermissionsSection {
    /// 解析模式字符串；未知值是配置错误而非静默回退
    pub fn parse_mode(&self) -> Result<PermissionMode, AgentError> {
        match self.mode.as_str() {
            "standard" => Ok(PermissionMode::Standard),
            "auto_approve" => Ok(PermissionMode::AutoApprove),
            "strict" => Ok(PermissionMode::Strict),
            other => Err(AgentError::Config(format!(
                "unknown permission mode \"{other}\" (expected standard | auto_approve | strict)"
            ))),
        }
    }
}

/// [openfoam] 段：目标发行版与版本（决定注入提示词的版本画像）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenFoamSection {
    pub distribution: String,
    pub version: String,
}

impl Default for OpenFoamSection {
    fn default() -> Self {
        Self {
            distribution: "foundation".to_string(),
            version: "11".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            limits: LimitsSection::default(),
            permissions: PermissionsSection::default(),
            openfoam: OpenFoamSection::default(),
        }
    }
}

impl AppConfig {
    /// 算例根目录（默认 ./cases）
    pub fn cases_dir(&self) -> PathBuf {
        self.app
            .cases_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("cases"))
    }

    /// 校验跨字段约束：权限模式可解析、版本画像存在、阈值在 (0, 1] 内
    pub fn validate(&self) -> Result<(), AgentError> {
        self.permissions.parse_mode()?;
        if version::lookup(&self.openfoam.distribution, &self.openfoam.version).is_none() {
            return Err(AgentError::Config(format!(
                "no version profile for {} {}",
                self.openfoam.distribution, self.openfoam.version
            )));
        }
        let t = self.limits.compaction_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(AgentError::Config(format!(
                "compaction_threshold must be in (0, 1], got {t}"
            )));
        }
        if self.limits.keep_recent_turns == 0 {
            return Err(AgentError::Config(
                "keep_recent_turns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 FOAMPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FOAMPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    // 本地覆盖层，不进版本库
    let local_names = ["config/local", "../config/local"];
    for name in local_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FOAMPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
