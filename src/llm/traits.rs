//! LLM 客户端抽象
//!
//! 后端（OpenAI 兼容 / Mock）实现 LlmClient；LlmError 区分可重试的传输类错误与
//! 不可重试的 API 错误，RetryingLlmClient 只对前者做有界退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Message;

/// LLM 调用错误
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("empty completion")]
    EmptyCompletion,
}

impl LlmError {
    /// 传输类错误可在同一轮内重试；API/协议错误直接上抛
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Timeout | LlmError::Connection(_))
    }
}

/// LLM 客户端 trait：非流式完成与累计 token 统计
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试配置：次数与固定退避
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

/// 重试装饰器：包住任意后端，对传输类错误做有界重试；一轮只消耗一次轮次预算
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(messages).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max = self.config.max_retries,
                        "transient LLM error, retrying: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
