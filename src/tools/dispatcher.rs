//! 工具调度器
//!
//! dispatch 按序做：注册表查找 -> 参数 JSON Schema 校验 -> 限时执行 -> 结果截断归一。
//! 未知工具与非法参数都是结果而非错误，循环把它们写回对话让模型改道；
//! 处理器的 Err 同样收敛为 failed 结果，绝不向循环传播。每次调度输出结构化审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::tools::ToolRegistry;

/// 结果状态：executed 与 rejected 不计入连续失败计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Executed,
    Failed,
    /// 权限门拒绝（由循环写入，调度器不产生）
    Rejected,
    UnknownTool,
    InvalidArguments,
    TimedOut,
    /// 调度中途被取消，结果不可知（由循环写入）
    OutcomeUnknown,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Executed => "executed",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Rejected => "rejected",
            OutcomeStatus::UnknownTool => "unknown_tool",
            OutcomeStatus::InvalidArguments => "invalid_arguments",
            OutcomeStatus::TimedOut => "timed_out",
            OutcomeStatus::OutcomeUnknown => "outcome_unknown",
        }
    }

    /// 是否计入连续失败计数（rejected 明确不计）
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            OutcomeStatus::Failed
                | OutcomeStatus::UnknownTool
                | OutcomeStatus::InvalidArguments
                | OutcomeStatus::TimedOut
        )
    }
}

/// 一次工具调用的归一化结果：状态 + 截断后的摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: OutcomeStatus,
    pub summary: String,
}

impl ToolOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            summary: reason.into(),
        }
    }

    pub fn unknown_after_cancel(tool: &str) -> Self {
        Self {
            status: OutcomeStatus::OutcomeUnknown,
            summary: format!("dispatch of {tool} was cancelled mid-flight, outcome unknown"),
        }
    }
}

/// 工具调度器：持有注册表，对每次调用施加 schema 校验、超时与结果上限
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_result_chars: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64, max_result_chars: usize) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            max_result_chars,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 调度一次工具调用；allowed 为该阶段的工具子集（按名过滤）
    pub async fn dispatch(&self, name: &str, args: &Value, allowed: &[String]) -> ToolOutcome {
        let start = Instant::now();
        let outcome = self.dispatch_inner(name, args, allowed).await;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "status": outcome.status.as_str(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        outcome
    }

    async fn dispatch_inner(&self, name: &str, args: &Value, allowed: &[String]) -> ToolOutcome {
        let in_subset = allowed.iter().any(|n| n == name);
        let tool = if in_subset { self.registry.get(name) } else { None };
        let Some(tool) = tool else {
            let available = if allowed.is_empty() {
                self.registry.tool_names()
            } else {
                allowed.to_vec()
            };
            return ToolOutcome {
                status: OutcomeStatus::UnknownTool,
                summary: format!(
                    "tool \"{name}\" does not exist; available tools: {}",
                    available.join(", ")
                ),
            };
        };

        // schema 不通过则处理器不会被调用
        if let Err(reason) = validate_args(&tool.parameters_schema(), args) {
            return ToolOutcome {
                status: OutcomeStatus::InvalidArguments,
                summary: self.clamp(&format!("arguments rejected by schema: {reason}")),
            };
        }

        match timeout(self.timeout, tool.execute(args.clone())).await {
            Ok(Ok(result)) => ToolOutcome {
                status: OutcomeStatus::Executed,
                summary: self.clamp(&result),
            },
            Ok(Err(e)) => ToolOutcome {
                status: OutcomeStatus::Failed,
                summary: self.clamp(&e),
            },
            Err(_) => ToolOutcome {
                status: OutcomeStatus::TimedOut,
                summary: format!("tool {name} timed out after {}s", self.timeout.as_secs()),
            },
        }
    }

    /// 尾截断到 max_result_chars，带标记
    fn clamp(&self, text: &str) -> String {
        if text.chars().count() <= self.max_result_chars {
            return text.to_string();
        }
        let clipped: String = text.chars().take(self.max_result_chars).collect();
        format!("{clipped}\n[result truncated]")
    }
}

/// 参数对 schema 的校验；错误串联所有违规项
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| format!("invalid tool schema: {e}"))?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    Err(errors.join("; "))
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::tools::Tool;

    struct CountingTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "write_file"
        }

        fn description(&self) -> &str {
            "writes a file"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            })
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("written".to_string())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("done".to_string())
        }
    }

    fn dispatcher_with(tool: impl Tool + 'static, timeout_secs: u64) -> ToolDispatcher {
        let mut reg = ToolRegistry::new();
        reg.register(tool);
        ToolDispatcher::new(Arc::new(reg), timeout_secs, 500)
    }

    #[tokio::test]
    async fn schema_invalid_args_never_reach_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(CountingTool { calls: calls.clone() }, 5);
        let allowed = vec!["write_file".to_string()];

        let bad = serde_json::json!({"path": 42});
        let outcome = d.dispatch("write_file", &bad, &allowed).await;
        assert_eq!(outcome.status, OutcomeStatus::InvalidArguments);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must not run");

        let good = serde_json::json!({"path": "0/U", "content": "uniform (2 0 0)"});
        let outcome = d.dispatch("write_file", &good, &allowed).await;
        assert_eq!(outcome.status, OutcomeStatus::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_outcome_not_an_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(CountingTool { calls }, 5);
        let allowed = vec!["write_file".to_string()];

        let outcome = d
            .dispatch("delete_everything", &serde_json::json!({}), &allowed)
            .await;
        assert_eq!(outcome.status, OutcomeStatus::UnknownTool);
        assert!(outcome.summary.contains("write_file"));
    }

    #[tokio::test]
    async fn out_of_subset_tool_is_unknown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(CountingTool { calls: calls.clone() }, 5);
        // 注册过但不在本阶段子集里
        let allowed = vec!["read_file".to_string()];

        let args = serde_json::json!({"path": "0/U", "content": "x"});
        let outcome = d.dispatch("write_file", &args, &allowed).await;
        assert_eq!(outcome.status, OutcomeStatus::UnknownTool);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let d = dispatcher_with(SlowTool, 1);
        let allowed = vec!["slow".to_string()];
        let outcome = d.dispatch("slow", &serde_json::json!({}), &allowed).await;
        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
    }

    #[tokio::test]
    async fn long_result_is_clamped() {
        struct VerboseTool;

        #[async_trait]
        impl Tool for VerboseTool {
            fn name(&self) -> &str {
                "verbose"
            }

            fn description(&self) -> &str {
                "prints a lot"
            }

            async fn execute(&self, _args: Value) -> Result<String, String> {
                Ok("x".repeat(10_000))
            }
        }

        let d = dispatcher_with(VerboseTool, 5);
        let allowed = vec!["verbose".to_string()];
        let outcome = d.dispatch("verbose", &serde_json::json!({}), &allowed).await;
        assert_eq!(outcome.status, OutcomeStatus::Executed);
        assert!(outcome.summary.chars().count() < 600);
        assert!(outcome.summary.ends_with("[result truncated]"));
    }
}
