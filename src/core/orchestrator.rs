//! 会话编排器：阶段流水线主控
//!
//! 负责：按 Consult -> Setup -> Mesh -> Run -> Analyze 顺序驱动各阶段循环，
//! 阶段间只传递已校验的封存载荷；Mesh 失败（循环出错或质量门未过）最多两次
//! 改道回 Setup 并携带失败详情，Run 不收敛直接判会话失败；每个阶段边界
//! 原子落盘会话状态。仿真失败是数据（SessionState 终态），不是 Err。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{run_phase, send_event, AgentEvent, PhaseSession};
use crate::config::AppConfig;
use crate::contract::{PhaseKind, PhaseReport};
use crate::core::permissions::{ApprovalResponder, PermissionMode, StaticApprover};
use crate::core::session::{
    PhaseRecord, PhaseStatus, SessionLog, SessionState, SessionStatus, StateManager,
};
use crate::core::AgentError;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::phases::{build_phase_spec, PriorReports};
use crate::tools::{ToolDispatcher, ToolRegistry};
use crate::version::{lookup, VersionProfile};

/// Mesh 失败改道回 Setup 的最大次数；之后会话失败
const MAX_MESH_REROUTES: usize = 2;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）。
/// 返回（推理客户端, 摘要客户端）；配置了 model_complex 时摘要走该模型。
pub(crate) fn create_llm_from_config(cfg: &AppConfig) -> (Arc<dyn LlmClient>, Arc<dyn LlmClient>) {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "mock" || api_key.is_none() {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        let mock: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![]));
        return (mock.clone(), mock);
    }

    let base = cfg.llm.base_url.as_deref();
    tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
    let reasoning: Arc<dyn LlmClient> = Arc::new(
        OpenAiClient::new(base, &cfg.llm.model, api_key.as_deref())
            .with_timeout(cfg.llm.request_timeout_secs),
    );
    let summarizer: Arc<dyn LlmClient> = match &cfg.llm.model_complex {
        Some(model) => {
            tracing::info!("Summaries use {}", model);
            Arc::new(
                OpenAiClient::new(base, model, api_key.as_deref())
                    .with_timeout(cfg.llm.request_timeout_secs),
            )
        }
        None => reasoning.clone(),
    };
    (reasoning, summarizer)
}

fn phase_index(kind: PhaseKind) -> usize {
    PhaseKind::SEQUENCE
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(0)
}

/// 从已封存的阶段记录提取类型化载荷；失败/中止的记录不参与
fn prior_reports(state: &SessionState) -> PriorReports<'_> {
    PriorReports {
        consult: match state.latest_report(PhaseKind::Consult) {
            Some(PhaseReport::Consult(r)) => Some(r),
            _ => None,
        },
        setup: match state.latest_report(PhaseKind::Setup) {
            Some(PhaseReport::Setup(r)) => Some(r),
            _ => None,
        },
        mesh: match state.latest_report(PhaseKind::Mesh) {
            Some(PhaseReport::Mesh(r)) => Some(r),
            _ => None,
        },
        run: match state.latest_report(PhaseKind::Run) {
            Some(PhaseReport::Run(r)) => Some(r),
            _ => None,
        },
    }
}

/// 按配置装配编排器：选择 LLM 后端并接好摘要客户端
pub fn create_orchestrator(
    cfg: AppConfig,
    registry: ToolRegistry,
) -> Result<Orchestrator, AgentError> {
    let (llm, summarizer) = create_llm_from_config(&cfg);
    Ok(Orchestrator::new(cfg, llm, registry)?.with_summarizer(summarizer))
}

/// 阶段流水线编排器
pub struct Orchestrator {
    cfg: AppConfig,
    llm: Arc<dyn LlmClient>,
    summarizer: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    approver: Arc<dyn ApprovalResponder>,
    mode: PermissionMode,
    profile: &'static VersionProfile,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
    cancel_token: CancellationToken,
}

impl Orchestrator {
    /// 创建编排器；llm 会被套上传输错误重试装饰器，调用方传裸客户端即可
    pub fn new(
        cfg: AppConfig,
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
    ) -> Result<Self, AgentError> {
        let profile = lookup(&cfg.openfoam.distribution, &cfg.openfoam.version).ok_or_else(|| {
            AgentError::Config(format!(
                "unsupported OpenFOAM target {} {}",
                cfg.openfoam.distribution, cfg.openfoam.version
            ))
        })?;
        let mode = cfg.permissions.parse_mode()?;
        let retry = RetryConfig {
            max_retries: cfg.llm.max_retries,
            ..RetryConfig::default()
        };
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(llm, retry));
        Ok(Self {
            summarizer: llm.clone(),
            llm,
            cfg,
            registry: Arc::new(registry),
            approver: Arc::new(StaticApprover::deny_all("no approver configured")),
            mode,
            profile,
            event_tx: None,
            cancel_token: CancellationToken::new(),
        })
    }

    /// 摘要用的客户端（同样会套重试装饰器）
    pub fn with_summarizer(mut self, summarizer: Arc<dyn LlmClient>) -> Self {
        let retry = RetryConfig {
            max_retries: self.cfg.llm.max_retries,
            ..RetryConfig::default()
        };
        self.summarizer = Arc::new(RetryingLlmClient::new(summarizer, retry));
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn ApprovalResponder>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 执行一次完整会话；Err 只表达基础设施故障（IO、配置），
    /// 仿真失败/中止体现在返回的 SessionState.status 上
    pub async fn run(&self, request: &str) -> Result<SessionState, AgentError> {
        let mut state = SessionState::new(request);
        let session_dir = self
            .cfg
            .cases_dir()
            .join(format!("case_{}", state.session_id));
        let state_mgr = StateManager::new(&session_dir);
        let log = SessionLog::create(&session_dir.join("session.log"))?;
        let event_tx = self.event_tx.as_ref();

        log.append(&format!("session {} started: {request}", state.session_id))?;
        send_event(
            &event_tx,
            AgentEvent::SessionStart {
                session_id: state.session_id.clone(),
                request: request.to_string(),
            },
        );
        state_mgr.save(&state)?;

        let dispatcher = ToolDispatcher::new(
            self.registry.clone(),
            self.cfg.limits.tool_timeout_secs,
            self.cfg.limits.max_result_chars,
        );

        let mut idx = 0usize;
        let mut mesh_reroutes = 0usize;
        let mut setup_feedback: Option<String> = None;

        while idx < PhaseKind::SEQUENCE.len() {
            let kind = PhaseKind::SEQUENCE[idx];
            let feedback = if kind == PhaseKind::Setup {
                setup_feedback.take()
            } else {
                None
            };

            // prior 借用 state，spec 构建完即释放
            let spec = {
                let prior = prior_reports(&state);
                build_phase_spec(
                    kind,
                    request,
                    &prior,
                    self.profile,
                    &self.cfg.limits.phase_turns,
                    &self.registry,
                    feedback.as_deref(),
                )
                .ok_or_else(|| {
                    AgentError::Config(format!(
                        "phase {} scheduled without required upstream payloads",
                        kind.as_str()
                    ))
                })?
            };

            let started_at = Utc::now();
            let mut session = PhaseSession::new(
                &spec,
                self.llm.clone(),
                &dispatcher,
                &log,
                &self.cfg.limits,
                self.cancel_token.clone(),
            )
            .with_mode(self.mode)
            .with_approver(self.approver.clone())
            .with_summarizer(self.summarizer.clone());
            if let Some(tx) = event_tx {
                session = session.with_event_tx(tx);
            }

            let result = run_phase(&session).await;
            let ended_at = Utc::now();

            match result {
                Ok(outcome) => match &outcome.report {
                    // 质量门未过：载荷有效但网格不可用，按失败记录并考虑改道
                    PhaseReport::Mesh(m) if !m.passed => {
                        let detail = if m.issues.is_empty() {
                            "mesh quality gates not met".to_string()
                        } else {
                            m.issues.join("; ")
                        };
                        state.phases.push(PhaseRecord {
                            kind,
                            status: PhaseStatus::Failed,
                            started_at,
                            ended_at,
                            turns_used: outcome.turns_used,
                            report: Some(outcome.report.clone()),
                            failure: Some(detail.clone()),
                        });
                        state.updated_at = Utc::now();
                        state_mgr.save(&state)?;
                        send_event(
                            &event_tx,
                            AgentEvent::PhaseFailed {
                                phase: kind.as_str().to_string(),
                                reason: detail.clone(),
                            },
                        );
                        if mesh_reroutes < MAX_MESH_REROUTES {
                            mesh_reroutes += 1;
                            log.append(&format!(
                                "mesh failed ({detail}), rerouting to setup (attempt {mesh_reroutes}/{MAX_MESH_REROUTES})"
                            ))?;
                            send_event(
                                &event_tx,
                                AgentEvent::Rerouted {
                                    from: "mesh".to_string(),
                                    to: "setup".to_string(),
                                    attempt: mesh_reroutes,
                                },
                            );
                            setup_feedback = Some(detail);
                            idx = phase_index(PhaseKind::Setup);
                            continue;
                        }
                        log.append(&format!(
                            "mesh failed after {MAX_MESH_REROUTES} reroutes, giving up"
                        ))?;
                        return self.seal(state, SessionStatus::Failed, &state_mgr, &log, event_tx);
                    }
                    // 求解不收敛：残差无效，重算无意义，直接失败
                    PhaseReport::Run(r) if !r.converged => {
                        let detail = if r.issues.is_empty() {
                            "solver did not converge".to_string()
                        } else {
                            r.issues.join("; ")
                        };
                        state.phases.push(PhaseRecord {
                            kind,
                            status: PhaseStatus::Failed,
                            started_at,
                            ended_at,
                            turns_used: outcome.turns_used,
                            report: Some(outcome.report.clone()),
                            failure: Some(detail.clone()),
                        });
                        state.updated_at = Utc::now();
                        state_mgr.save(&state)?;
                        send_event(
                            &event_tx,
                            AgentEvent::PhaseFailed {
                                phase: kind.as_str().to_string(),
                                reason: detail.clone(),
                            },
                        );
                        log.append(&format!("run did not converge ({detail}), giving up"))?;
                        return self.seal(state, SessionStatus::Failed, &state_mgr, &log, event_tx);
                    }
                    _ => {
                        state.phases.push(PhaseRecord {
                            kind,
                            status: PhaseStatus::Succeeded,
                            started_at,
                            ended_at,
                            turns_used: outcome.turns_used,
                            report: Some(outcome.report),
                            failure: None,
                        });
                        state.updated_at = Utc::now();
                        state_mgr.save(&state)?;
                        idx += 1;
                    }
                },
                Err(AgentError::Cancelled) => {
                    state.phases.push(PhaseRecord {
                        kind,
                        status: PhaseStatus::Aborted,
                        started_at,
                        ended_at,
                        turns_used: 0,
                        report: None,
                        failure: Some("cancelled".to_string()),
                    });
                    state.updated_at = Utc::now();
                    state_mgr.save(&state)?;
                    log.append("session aborted by cancellation")?;
                    return self.seal(state, SessionStatus::Aborted, &state_mgr, &log, event_tx);
                }
                Err(e) => {
                    let detail = e.to_string();
                    state.phases.push(PhaseRecord {
                        kind,
                        status: PhaseStatus::Failed,
                        started_at,
                        ended_at,
                        turns_used: 0,
                        report: None,
                        failure: Some(detail.clone()),
                    });
                    state.updated_at = Utc::now();
                    state_mgr.save(&state)?;
                    send_event(
                        &event_tx,
                        AgentEvent::PhaseFailed {
                            phase: kind.as_str().to_string(),
                            reason: detail.clone(),
                        },
                    );
                    // Mesh 的硬失败与质量门失败走同一条改道路径
                    if kind == PhaseKind::Mesh && mesh_reroutes < MAX_MESH_REROUTES {
                        mesh_reroutes += 1;
                        log.append(&format!(
                            "mesh failed ({detail}), rerouting to setup (attempt {mesh_reroutes}/{MAX_MESH_REROUTES})"
                        ))?;
                        send_event(
                            &event_tx,
                            AgentEvent::Rerouted {
                                from: "mesh".to_string(),
                                to: "setup".to_string(),
                                attempt: mesh_reroutes,
                            },
                        );
                        setup_feedback = Some(detail);
                        idx = phase_index(PhaseKind::Setup);
                        continue;
                    }
                    log.append(&format!("phase {} failed: {detail}", kind.as_str()))?;
                    return self.seal(state, SessionStatus::Failed, &state_mgr, &log, event_tx);
                }
            }
        }

        self.seal(state, SessionStatus::Completed, &state_mgr, &log, event_tx)
    }

    fn seal(
        &self,
        mut state: SessionState,
        status: SessionStatus,
        state_mgr: &StateManager,
        log: &SessionLog,
        event_tx: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) -> Result<SessionState, AgentError> {
        state.status = status;
        state.updated_at = Utc::now();
        state_mgr.save(&state)?;
        log.append(&format!(
            "session {} ended: {}",
            state.session_id,
            status.as_str()
        ))?;
        send_event(
            &event_tx,
            AgentEvent::SessionEnd {
                session_id: state.session_id.clone(),
                status: status.as_str().to_string(),
            },
        );
        Ok(state)
    }
}
