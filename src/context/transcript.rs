//! 阶段上下文：固定区 + 轮次列表
//!
//! 每个阶段从空转录开始（阶段间不共享对话，只传阶段载荷）。system 与任务提示词是
//! 固定区，永不压缩；其后是有序的 Turn 列表，渲染为发给 LLM 的消息序列。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::estimator::TokenEstimator;
use crate::tools::ToolOutcome;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一轮解析出的动作：工具调用或终端文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnAction {
    ToolCall { name: String, args: Value },
    Terminal { text: String },
}

/// 一个 Turn：补全文本、解析出的动作、工具结果与写回对话的观察
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub assistant_text: String,
    pub action: TurnAction,
    #[serde(default)]
    pub outcome: Option<ToolOutcome>,
    /// 写回对话的观察文本（工具结果、拒绝说明或合同违规反馈）
    #[serde(default)]
    pub observation: Option<String>,
    /// 压缩产生的合成摘要轮（渲染为 user 消息）
    #[serde(default)]
    pub synthetic: bool,
}

impl Turn {
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            assistant_text: text.into(),
            action: TurnAction::Terminal {
                text: String::new(),
            },
            outcome: None,
            observation: None,
            synthetic: true,
        }
    }
}

/// 阶段上下文：固定提示词 + 轮次；占用与压缩判定都在这里
#[derive(Debug, Clone)]
pub struct PhaseContext {
    system_prompt: String,
    task_prompt: String,
    turns: Vec<Turn>,
    window_tokens: usize,
    threshold: f64,
    keep_recent: usize,
}

impl PhaseContext {
    pub fn new(
        system_prompt: impl Into<String>,
        task_prompt: impl Into<String>,
        window_tokens: usize,
        threshold: f64,
        keep_recent: usize,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            task_prompt: task_prompt.into(),
            turns: Vec::new(),
            window_tokens: window_tokens.max(1),
            threshold,
            // 最近一轮永不压缩
            keep_recent: keep_recent.max(1),
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn window_tokens(&self) -> usize {
        self.window_tokens
    }

    /// 渲染为 LLM 消息序列：system、user(task)，每轮 assistant(+observation)；
    /// 合成摘要轮渲染为单条 user 消息
    pub fn to_messages(&self) -> Vec<Message> {
        let mut msgs = Vec::with_capacity(2 + self.turns.len() * 2);
        msgs.push(Message::system(self.system_prompt.clone()));
        msgs.push(Message::user(self.task_prompt.clone()));
        for turn in &self.turns {
            if turn.synthetic {
                msgs.push(Message::user(turn.assistant_text.clone()));
                continue;
            }
            msgs.push(Message::assistant(turn.assistant_text.clone()));
            if let Some(obs) = &turn.observation {
                msgs.push(Message::user(obs.clone()));
            }
        }
        msgs
    }

    /// 当前渲染请求的估算 token 数
    pub fn estimated_tokens(&self) -> usize {
        TokenEstimator::estimate_messages(&self.to_messages())
    }

    /// 占用比 = 估算 token / 窗口
    pub fn occupancy(&self) -> f64 {
        self.estimated_tokens() as f64 / self.window_tokens as f64
    }

    /// 每次 LLM 请求前检查
    pub fn should_compact(&self) -> bool {
        self.occupancy() >= self.threshold
    }

    /// 可压缩的最老连续轮段；不足 keep_recent 时为 None
    pub fn compactable_range(&self) -> Option<std::ops::Range<usize>> {
        if self.turns.len() <= self.keep_recent {
            return None;
        }
        Some(0..self.turns.len() - self.keep_recent)
    }

    /// 用一条合成摘要轮替换指定轮段
    pub fn replace_with_summary(&mut self, range: std::ops::Range<usize>, summary_turn: Turn) {
        self.turns.splice(range, std::iter::once(summary_turn));
    }

    /// 被压缩轮段渲染为供摘要模型阅读的文本
    pub fn render_turns_for_summary(&self, range: &std::ops::Range<usize>) -> String {
        let mut out = String::new();
        for turn in &self.turns[range.clone()] {
            out.push_str("assistant: ");
            out.push_str(&turn.assistant_text);
            out.push('\n');
            if let Some(obs) = &turn.observation {
                out.push_str("observation: ");
                out.push_str(obs);
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_turn(text: &str, obs: &str) -> Turn {
        Turn {
            assistant_text: text.to_string(),
            action: TurnAction::ToolCall {
                name: "read_file".to_string(),
                args: serde_json::json!({"path": "system/controlDict"}),
            },
            outcome: None,
            observation: Some(obs.to_string()),
            synthetic: false,
        }
    }

    #[test]
    fn renders_pinned_then_turns() {
        let mut ctx = PhaseContext::new("sys", "task", 1000, 0.7, 1);
        ctx.push_turn(tool_turn("calling read_file", "Observation from read_file: ok"));
        let msgs = ctx.to_messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[2].role, Role::Assistant);
        assert_eq!(msgs[3].role, Role::User);
    }

    #[test]
    fn occupancy_grows_as_turns_append() {
        let mut ctx = PhaseContext::new("sys", "task", 1000, 0.7, 1);
        let mut last = ctx.occupancy();
        for i in 0..5 {
            ctx.push_turn(tool_turn(
                &format!("step {i} with some reasoning text"),
                "Observation from read_file: file contents here",
            ));
            let now = ctx.occupancy();
            assert!(now >= last, "occupancy must not decrease between compactions");
            last = now;
        }
    }

    #[test]
    fn compactable_range_spares_recent() {
        let mut ctx = PhaseContext::new("sys", "task", 1000, 0.7, 2);
        assert!(ctx.compactable_range().is_none());
        for i in 0..5 {
            ctx.push_turn(tool_turn(&format!("t{i}"), "obs"));
        }
        assert_eq!(ctx.compactable_range(), Some(0..3));
    }

    #[test]
    fn summary_turn_renders_as_user() {
        let mut ctx = PhaseContext::new("sys", "task", 1000, 0.7, 1);
        for i in 0..4 {
            ctx.push_turn(tool_turn(&format!("t{i}"), "obs"));
        }
        let range = ctx.compactable_range().unwrap();
        ctx.replace_with_summary(range, Turn::summary("summary of earlier turns"));
        let msgs = ctx.to_messages();
        // system + task + summary(user) + 最后一轮 assistant + observation
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[2].role, Role::User);
        assert!(msgs[2].content.contains("summary"));
        assert!(ctx.turns()[0].synthetic);
    }
}
