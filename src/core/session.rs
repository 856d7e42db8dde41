//! 会话状态与留痕
//!
//! SessionState 在每个阶段边界后原子重写到 foampilot_state.json（临时文件 + rename），
//! 同时生成给人看的 FOAMPILOT.md。SessionLog 是独立的逐行追加日志：每一轮、每个权限
//! 决定、每次压缩与阶段边界都先落盘再继续。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contract::{PhaseKind, PhaseReport};
use crate::core::AgentError;

/// 会话终态机：Running 之外都是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

/// 单个阶段的执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
    Aborted,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Aborted => "aborted",
        }
    }
}

/// 阶段封存记录：一旦写入不再更改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub turns_used: usize,
    #[serde(default)]
    pub report: Option<PhaseReport>,
    #[serde(default)]
    pub failure: Option<String>,
}

/// 会话状态：id、请求、阶段记录与当前状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub request: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phases: Vec<PhaseRecord>,
}

impl SessionState {
    pub fn new(request: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: new_session_id(),
            request: request.into(),
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
            phases: Vec::new(),
        }
    }

    /// 某阶段最近一次成功封存的载荷
    pub fn latest_report(&self, kind: PhaseKind) -> Option<&PhaseReport> {
        self.phases
            .iter()
            .rev()
            .filter(|p| p.kind == kind && p.status == PhaseStatus::Succeeded)
            .find_map(|p| p.report.as_ref())
    }
}

/// 短会话 id（uuid4 前 8 位）
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// 状态持久化：每个阶段边界后调用
pub struct StateManager {
    dir: PathBuf,
}

impl StateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 原子重写 foampilot_state.json（临时文件 + rename），随后刷新 FOAMPILOT.md
    pub fn save(&self, state: &SessionState) -> Result<(), AgentError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.dir.join("foampilot_state.json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.dir.join("foampilot_state.json"))?;
        std::fs::write(self.dir.join("FOAMPILOT.md"), render_markdown(state))?;
        Ok(())
    }

    pub fn load(&self) -> Result<SessionState, AgentError> {
        let raw = std::fs::read_to_string(self.dir.join("foampilot_state.json"))?;
        let state = serde_json::from_str(&raw)?;
        Ok(state)
    }
}

fn render_markdown(state: &SessionState) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# foampilot session {}\n\nStatus: {}\nRequest: {}\nUpdated: {}\n\n## Phases\n\n",
        state.session_id,
        state.status.as_str(),
        state.request,
        state.updated_at.to_rfc3339()
    ));
    for p in &state.phases {
        let detail = match (&p.report, &p.failure) {
            (_, Some(f)) => format!("failure: {f}"),
            (Some(_), None) => "report sealed".to_string(),
            (None, None) => String::new(),
        };
        out.push_str(&format!(
            "- {}: {} ({} turns) {}\n",
            p.kind.as_str(),
            p.status.as_str(),
            p.turns_used,
            detail
        ));
    }
    out
}

/// 追加式会话日志：逐行、带时间戳，写后即 flush
pub struct SessionLog {
    file: Mutex<File>,
}

impl SessionLog {
    pub fn create(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// 追加一行并 flush；循环在此失败时不得继续
    pub fn append(&self, text: &str) -> Result<(), AgentError> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), text)?;
        file.flush()?;
        Ok(())
    }
}
