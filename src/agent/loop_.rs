//! 阶段 Agent 循环
//!
//! 一个阶段 = 一次循环：请求前查占用并按需压缩 -> LLM 补全 -> 解析动作 ->
//! 工具调用走权限门与调度器，观察写回对话；终端文本走合同校验，违规作为可恢复反馈。
//! 连续失败达到上限或轮次预算耗尽则阶段失败。两个挂起点（等模型、等批准）都可取消；
//! 每一轮先落会话日志再继续。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::action::{parse_action, ParsedAction};
use crate::agent::events::{send_event, AgentEvent};
use crate::config::LimitsSection;
use crate::context::{compact, PhaseContext, Turn, TurnAction};
use crate::contract::{extract_payload, PhaseReport};
use crate::core::permissions::{
    effective, ApprovalDecision, ApprovalRequest, ApprovalResponder, GateAction, PermissionLevel,
    PermissionMode, StaticApprover,
};
use crate::core::session::SessionLog;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::phases::PhaseSpec;
use crate::tools::{OutcomeStatus, ToolDispatcher, ToolOutcome};

/// 事件与日志里结果预览的最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 阶段循环的执行环境
pub struct PhaseSession<'a> {
    pub spec: &'a PhaseSpec,
    /// 推理客户端（外层通常已套重试装饰器）
    pub llm: Arc<dyn LlmClient>,
    /// 压缩摘要客户端；默认与推理同一后端
    pub summarizer: Arc<dyn LlmClient>,
    pub dispatcher: &'a ToolDispatcher,
    pub mode: PermissionMode,
    pub approver: Arc<dyn ApprovalResponder>,
    pub log: &'a SessionLog,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<&'a tokio::sync::mpsc::UnboundedSender<AgentEvent>>,
    pub limits: &'a LimitsSection,
}

impl<'a> PhaseSession<'a> {
    /// 创建最小配置的 PhaseSession
    pub fn new(
        spec: &'a PhaseSpec,
        llm: Arc<dyn LlmClient>,
        dispatcher: &'a ToolDispatcher,
        log: &'a SessionLog,
        limits: &'a LimitsSection,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            spec,
            summarizer: llm.clone(),
            llm,
            dispatcher,
            mode: PermissionMode::Standard,
            // 无人值守默认拒绝，嵌入方自行提供真正的批准方
            approver: Arc::new(StaticApprover::deny_all("no approver configured")),
            log,
            cancel_token,
            event_tx: None,
            limits,
        }
    }

    pub fn with_mode(mut self, mode: PermissionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn ApprovalResponder>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn LlmClient>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a tokio::sync::mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 阶段成功的产物：已校验载荷与用掉的轮数
#[derive(Debug)]
pub struct PhaseOutcome {
    pub report: PhaseReport,
    pub turns_used: usize,
}

fn preview_of(text: &str) -> String {
    let p: String = text.chars().take(RESULT_PREVIEW_CHARS).collect();
    if text.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{p}...")
    } else {
        p
    }
}

/// 按结果状态生成写回对话的观察文本
fn observation_for(tool: &str, outcome: &ToolOutcome) -> String {
    match outcome.status {
        OutcomeStatus::Executed => format!("Observation from {tool}: {}", outcome.summary),
        OutcomeStatus::Failed => format!("Observation from {tool}: Error: {}", outcome.summary),
        OutcomeStatus::Rejected => format!(
            "Tool call {tool} was rejected: {}. Choose another approach.",
            outcome.summary
        ),
        OutcomeStatus::UnknownTool => format!("Observation: {}", outcome.summary),
        OutcomeStatus::InvalidArguments => {
            format!("Observation from {tool}: {}", outcome.summary)
        }
        OutcomeStatus::TimedOut => format!("Observation from {tool}: {}", outcome.summary),
        OutcomeStatus::OutcomeUnknown => format!("Observation from {tool}: {}", outcome.summary),
    }
}

/// 执行一个阶段的 Agent 循环
pub async fn run_phase(session: &PhaseSession<'_>) -> Result<PhaseOutcome, AgentError> {
    let spec = session.spec;
    let phase = spec.kind.as_str();
    let limits = session.limits;
    let event_tx = session.event_tx;

    let mut ctx = PhaseContext::new(
        spec.system_prompt.clone(),
        spec.task_prompt.clone(),
        limits.context_window_tokens,
        limits.compaction_threshold,
        limits.keep_recent_turns,
    );
    let mut consecutive_failures = 0usize;
    let (init_prompt, init_completion, _) = session.llm.token_usage();

    session.log.append(&format!(
        "phase {phase} started (budget {} turns, tools: {})",
        spec.turn_budget,
        spec.allowed_tools.join(", ")
    ))?;
    send_event(
        &event_tx,
        AgentEvent::PhaseStart {
            phase: phase.to_string(),
            turn_budget: spec.turn_budget,
        },
    );

    for turn_index in 0..spec.turn_budget {
        let turn_no = turn_index + 1;

        if session.cancel_token.is_cancelled() {
            session
                .log
                .append(&format!("phase {phase} cancelled before turn {turn_no}"))?;
            send_event(&event_tx, AgentEvent::Error { text: "cancelled".to_string() });
            return Err(AgentError::Cancelled);
        }

        // 每次请求前检查占用；压缩必须使占用严格下降
        if ctx.should_compact() {
            let report = compact(&mut ctx, session.summarizer.as_ref(), phase).await?;
            if report.changed {
                session.log.append(&format!(
                    "compaction: dropped {} turns, occupancy {:.4} -> {:.4}",
                    report.turns_dropped, report.occupancy_before, report.occupancy_after
                ))?;
                send_event(
                    &event_tx,
                    AgentEvent::Compaction {
                        occupancy_before: report.occupancy_before,
                        occupancy_after: report.occupancy_after,
                        turns_dropped: report.turns_dropped,
                    },
                );
            } else if ctx.should_compact() {
                // 固定区自身超阈值，无轮可压
                session
                    .log
                    .append(&format!("phase {phase} failed: nothing left to compact"))?;
                return Err(AgentError::ContextOverflow(
                    "pinned prompts alone exceed the compaction threshold".to_string(),
                ));
            }
        }

        send_event(&event_tx, AgentEvent::Thinking { phase: phase.to_string() });
        let messages = ctx.to_messages();
        let output = tokio::select! {
            _ = session.cancel_token.cancelled() => {
                session.log.append(&format!(
                    "phase {phase} cancelled while waiting for the model (turn {turn_no})"
                ))?;
                send_event(&event_tx, AgentEvent::Error { text: "cancelled".to_string() });
                return Err(AgentError::Cancelled);
            }
            result = session.llm.complete(&messages) => {
                result.map_err(|e| AgentError::Llm(e.to_string()))?
            }
        };

        match parse_action(&output) {
            ParsedAction::ToolCall(env) => {
                send_event(
                    &event_tx,
                    AgentEvent::ToolCall {
                        tool: env.tool.clone(),
                        args: env.args.clone(),
                    },
                );
                let level = session
                    .dispatcher
                    .registry()
                    .permission_level(&env.tool)
                    .unwrap_or(PermissionLevel::Auto);
                let gate = effective(session.mode, level);
                session.log.append(&format!(
                    "permission: tool {} level {} mode {} -> {}",
                    env.tool,
                    level.as_str(),
                    session.mode.as_str(),
                    match gate {
                        GateAction::Dispatch => "dispatch",
                        GateAction::DispatchWithNotice => "dispatch_with_notice",
                        GateAction::RequireApproval => "require_approval",
                    }
                ))?;

                let mut denied: Option<ToolOutcome> = None;
                match gate {
                    GateAction::Dispatch => {}
                    GateAction::DispatchWithNotice => {
                        send_event(
                            &event_tx,
                            AgentEvent::PermissionNotice {
                                tool: env.tool.clone(),
                                level: level.as_str().to_string(),
                                mode: session.mode.as_str().to_string(),
                            },
                        );
                    }
                    GateAction::RequireApproval => {
                        send_event(
                            &event_tx,
                            AgentEvent::ApprovalRequested {
                                tool: env.tool.clone(),
                                phase: phase.to_string(),
                            },
                        );
                        session
                            .log
                            .append(&format!("approval requested for {}", env.tool))?;
                        let request = ApprovalRequest {
                            tool: env.tool.clone(),
                            args: env.args.clone(),
                            phase: phase.to_string(),
                        };
                        let decision = tokio::select! {
                            _ = session.cancel_token.cancelled() => {
                                session.log.append(&format!(
                                    "phase {phase} cancelled while waiting for approval of {}",
                                    env.tool
                                ))?;
                                send_event(&event_tx, AgentEvent::Error { text: "cancelled".to_string() });
                                return Err(AgentError::Cancelled);
                            }
                            d = session.approver.respond(request) => d
                        };
                        match decision {
                            ApprovalDecision::Allow => {
                                session
                                    .log
                                    .append(&format!("approval granted for {}", env.tool))?;
                            }
                            ApprovalDecision::Deny { reason } => {
                                session.log.append(&format!(
                                    "approval denied for {}: {reason}",
                                    env.tool
                                ))?;
                                denied = Some(ToolOutcome::rejected(reason));
                            }
                        }
                    }
                }

                let outcome = match denied {
                    Some(o) => o,
                    None => {
                        tokio::select! {
                            _ = session.cancel_token.cancelled() => {
                                // 尽力留痕：在途调用的结果不可知
                                let unknown = ToolOutcome::unknown_after_cancel(&env.tool);
                                let _ = session.log.append(&format!(
                                    "turn {turn_no}: tool {} -> {}",
                                    env.tool, unknown.summary
                                ));
                                send_event(&event_tx, AgentEvent::Error { text: "cancelled".to_string() });
                                return Err(AgentError::Cancelled);
                            }
                            o = session.dispatcher.dispatch(&env.tool, &env.args, &spec.allowed_tools) => o
                        }
                    }
                };

                send_event(
                    &event_tx,
                    AgentEvent::ToolResult {
                        tool: env.tool.clone(),
                        status: outcome.status.as_str().to_string(),
                        preview: preview_of(&outcome.summary),
                    },
                );
                if outcome.status.counts_as_failure() {
                    consecutive_failures += 1;
                } else if outcome.status == OutcomeStatus::Executed {
                    consecutive_failures = 0;
                }
                // Rejected 既不累计也不清零

                let observation = observation_for(&env.tool, &outcome);
                session.log.append(&format!(
                    "turn {turn_no}: tool {} -> {} ({})",
                    env.tool,
                    outcome.status.as_str(),
                    preview_of(&outcome.summary)
                ))?;
                ctx.push_turn(Turn {
                    assistant_text: output.clone(),
                    action: TurnAction::ToolCall {
                        name: env.tool.clone(),
                        args: env.args.clone(),
                    },
                    outcome: Some(outcome),
                    observation: Some(observation),
                    synthetic: false,
                });

                if consecutive_failures >= limits.tool_failure_limit {
                    session.log.append(&format!(
                        "phase {phase} failed: tool failure limit ({}) exceeded",
                        limits.tool_failure_limit
                    ))?;
                    send_event(
                        &event_tx,
                        AgentEvent::Error {
                            text: "tool failure limit exceeded".to_string(),
                        },
                    );
                    return Err(AgentError::ToolFailureLimit {
                        phase: phase.to_string(),
                        limit: limits.tool_failure_limit,
                    });
                }
            }

            ParsedAction::Terminal(text) => match extract_payload(spec.kind, &text) {
                Ok(report) => {
                    ctx.push_turn(Turn {
                        assistant_text: output.clone(),
                        action: TurnAction::Terminal { text },
                        outcome: None,
                        observation: None,
                        synthetic: false,
                    });
                    session
                        .log
                        .append(&format!("turn {turn_no}: terminal payload accepted"))?;
                    session
                        .log
                        .append(&format!("phase {phase} completed in {turn_no} turns"))?;

                    let (cur_prompt, cur_completion, cur_total) = session.llm.token_usage();
                    send_event(
                        &event_tx,
                        AgentEvent::TokenUsage {
                            prompt_tokens: cur_prompt.saturating_sub(init_prompt),
                            completion_tokens: cur_completion.saturating_sub(init_completion),
                            total_tokens: cur_prompt.saturating_sub(init_prompt)
                                + cur_completion.saturating_sub(init_completion),
                            cumulative_prompt: cur_prompt,
                            cumulative_completion: cur_completion,
                            cumulative_total: cur_total,
                        },
                    );
                    send_event(
                        &event_tx,
                        AgentEvent::PhaseCompleted {
                            phase: phase.to_string(),
                            turns_used: turn_no,
                        },
                    );
                    return Ok(PhaseOutcome {
                        report,
                        turns_used: turn_no,
                    });
                }
                Err(violation) => {
                    consecutive_failures += 1;
                    let observation = format!(
                        "Response rejected: {violation}. Finish the phase with a single JSON payload of the required shape, or call a tool."
                    );
                    session
                        .log
                        .append(&format!("turn {turn_no}: contract violation ({violation})"))?;
                    ctx.push_turn(Turn {
                        assistant_text: output.clone(),
                        action: TurnAction::Terminal { text },
                        outcome: None,
                        observation: Some(observation),
                        synthetic: false,
                    });
                    if consecutive_failures >= limits.tool_failure_limit {
                        session.log.append(&format!(
                            "phase {phase} failed: tool failure limit ({}) exceeded",
                            limits.tool_failure_limit
                        ))?;
                        send_event(
                            &event_tx,
                            AgentEvent::Error {
                                text: "tool failure limit exceeded".to_string(),
                            },
                        );
                        return Err(AgentError::ToolFailureLimit {
                            phase: phase.to_string(),
                            limit: limits.tool_failure_limit,
                        });
                    }
                }
            },

            ParsedAction::Malformed(reason) => {
                consecutive_failures += 1;
                let observation = format!(
                    "Malformed action: {reason}. Reply with one valid tool call envelope or the final payload."
                );
                session
                    .log
                    .append(&format!("turn {turn_no}: malformed action ({reason})"))?;
                ctx.push_turn(Turn {
                    assistant_text: output.clone(),
                    action: TurnAction::Terminal { text: output.clone() },
                    outcome: None,
                    observation: Some(observation),
                    synthetic: false,
                });
                if consecutive_failures >= limits.tool_failure_limit {
                    session.log.append(&format!(
                        "phase {phase} failed: tool failure limit ({}) exceeded",
                        limits.tool_failure_limit
                    ))?;
                    send_event(
                        &event_tx,
                        AgentEvent::Error {
                            text: "tool failure limit exceeded".to_string(),
                        },
                    );
                    return Err(AgentError::ToolFailureLimit {
                        phase: phase.to_string(),
                        limit: limits.tool_failure_limit,
                    });
                }
            }
        }
    }

    session
        .log
        .append(&format!("phase {phase} failed: turn budget exhausted"))?;
    send_event(
        &event_tx,
        AgentEvent::Error {
            text: "turn budget exhausted".to_string(),
        },
    );
    Err(AgentError::TurnBudgetExhausted {
        phase: phase.to_string(),
        budget: spec.turn_budget,
    })
}
