//! Context Compaction
//!
//! 占用比达到阈值时，把最老的连续轮段交给摘要模型，替换为一条合成摘要轮。
//! 固定区与最近 keep_recent 轮不动。压缩必须使占用严格下降，否则视为上下文失效，
//! 由调用方让阶段失败；无可压缩轮段时是幂等 no-op。

use crate::context::transcript::{PhaseContext, Turn};
use crate::context::Message;
use crate::core::AgentError;
use crate::llm::LlmClient;

/// 合成摘要轮的标记行（进入对话原文）
pub const SUMMARY_MARKER: &str = "[CONVERSATION SUMMARY - history compacted to save context]";

const SUMMARIZE_SYSTEM_PROMPT: &str = "\
You are compacting the transcript of an in-progress CFD case automation session. \
Write a dense summary that preserves, in this order: the original user request, \
every decision already made (solver, models, boundary conditions), the current \
state of case files, assumptions taken, and unresolved issues. Do not invent \
information. Plain text only.";

/// 一次压缩的结果：是否发生、前后占用与丢弃轮数
#[derive(Debug, Clone, Copy)]
pub struct CompactionReport {
    pub changed: bool,
    pub occupancy_before: f64,
    pub occupancy_after: f64,
    pub turns_dropped: usize,
}

/// 执行一次压缩；无可压缩轮段时返回 changed=false 且上下文不变
pub async fn compact(
    ctx: &mut PhaseContext,
    summarizer: &dyn LlmClient,
    phase: &str,
) -> Result<CompactionReport, AgentError> {
    let occupancy_before = ctx.occupancy();

    let Some(range) = ctx.compactable_range() else {
        return Ok(CompactionReport {
            changed: false,
            occupancy_before,
            occupancy_after: occupancy_before,
            turns_dropped: 0,
        });
    };

    let dropped = range.len();
    let transcript = ctx.render_turns_for_summary(&range);
    let messages = vec![
        Message::system(SUMMARIZE_SYSTEM_PROMPT),
        Message::user(format!(
            "Current phase: {phase}\n\nTranscript to compact:\n{transcript}"
        )),
    ];
    let summary = summarizer
        .complete(&messages)
        .await
        .map_err(|e| AgentError::Llm(format!("summarizer failed: {e}")))?;
    // 摘要为空也要留痕，压缩记录不能丢
    let summary = if summary.trim().is_empty() {
        "(summary unavailable)".to_string()
    } else {
        summary.trim().to_string()
    };

    ctx.replace_with_summary(range, Turn::summary(format!("{SUMMARY_MARKER}\n\n{summary}")));

    let occupancy_after = ctx.occupancy();
    if occupancy_after >= occupancy_before {
        return Err(AgentError::ContextOverflow(format!(
            "compaction did not reduce occupancy ({occupancy_before:.4} -> {occupancy_after:.4})"
        )));
    }

    Ok(CompactionReport {
        changed: true,
        occupancy_before,
        occupancy_after,
        turns_dropped: dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::transcript::TurnAction;
    use crate::llm::MockLlmClient;

    fn bulky_turn(i: usize) -> Turn {
        Turn {
            assistant_text: format!(
                "step {i}: inspecting boundary conditions and tutorial layout, {}",
                "reasoning ".repeat(40)
            ),
            action: TurnAction::ToolCall {
                name: "read_file".to_string(),
                args: serde_json::json!({"path": format!("file_{i}")}),
            },
            outcome: None,
            observation: Some(format!("Observation from read_file: {}", "data ".repeat(60))),
            synthetic: false,
        }
    }

    #[tokio::test]
    async fn compaction_strictly_reduces_occupancy() {
        let mut ctx = PhaseContext::new("sys", "task", 2000, 0.5, 1);
        for i in 0..8 {
            ctx.push_turn(bulky_turn(i));
        }
        let before = ctx.occupancy();
        assert!(ctx.should_compact());

        let mock = MockLlmClient::new(vec!["short summary of steps 0-6".to_string()]);
        let report = compact(&mut ctx, &mock, "setup").await.unwrap();
        assert!(report.changed);
        assert_eq!(report.turns_dropped, 7);
        assert!(report.occupancy_after < before);
        assert!(ctx.occupancy() < before);

        // 摘要轮在保留轮之前
        assert!(ctx.turns()[0].synthetic);
        assert!(ctx.turns()[0].assistant_text.starts_with(SUMMARY_MARKER));
        assert!(!ctx.turns()[1].synthetic);
    }

    #[tokio::test]
    async fn minimal_transcript_is_a_noop() {
        let mut ctx = PhaseContext::new("sys", "task", 2000, 0.5, 2);
        ctx.push_turn(bulky_turn(0));
        let before = ctx.occupancy();

        let mock = MockLlmClient::new(vec!["unused".to_string()]);
        let report = compact(&mut ctx, &mock, "mesh").await.unwrap();
        assert!(!report.changed);
        assert_eq!(report.turns_dropped, 0);
        let after = ctx.occupancy();
        assert!((after - before).abs() < 1e-9);
        assert_eq!(ctx.turns().len(), 1);
    }

    #[tokio::test]
    async fn empty_summary_leaves_a_placeholder() {
        let mut ctx = PhaseContext::new("sys", "task", 2000, 0.5, 1);
        for i in 0..6 {
            ctx.push_turn(bulky_turn(i));
        }
        let mock = MockLlmClient::new(vec!["   ".to_string()]);
        let report = compact(&mut ctx, &mock, "run").await.unwrap();
        assert!(report.changed);
        assert!(ctx.turns()[0].assistant_text.contains("(summary unavailable)"));
    }

    #[tokio::test]
    async fn most_recent_turn_survives_compaction() {
        let mut ctx = PhaseContext::new("sys", "task", 2000, 0.5, 1);
        for i in 0..5 {
            ctx.push_turn(bulky_turn(i));
        }
        let mock = MockLlmClient::new(vec!["summary".to_string()]);
        compact(&mut ctx, &mock, "setup").await.unwrap();
        let last = ctx.turns().last().unwrap();
        assert!(last.assistant_text.contains("step 4"));
    }
}
