//! Token 估算
//!
//! 确定性的字符计数近似，不做网络调用：英文约 4 字符/token，非 ASCII 约 1.5 字符/token。
//! 占用比与压缩判定都建立在这个估算上，保证可离线测试。

use crate::context::transcript::Message;

/// 每条消息的角色与分隔开销（估算常数）
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let mut tokens = ascii_chars / 4;
        tokens += (non_ascii_chars as f64 / 1.5).ceil() as usize;

        tokens.max(1)
    }

    /// 估算整个消息序列（含每条消息的固定开销）
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate(&m.content) + PER_MESSAGE_OVERHEAD)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_text_estimate() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn non_ascii_text_estimate() {
        let tokens = TokenEstimator::estimate("入口速度二米每秒");
        assert!(tokens > 0);
    }

    #[test]
    fn empty_text_is_one_token() {
        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    #[test]
    fn estimate_is_deterministic() {
        let text = "blockMesh then checkMesh before solving";
        assert_eq!(TokenEstimator::estimate(text), TokenEstimator::estimate(text));
    }

    #[test]
    fn messages_include_overhead() {
        let msgs = vec![Message::system("abcd"), Message::user("efgh")];
        let total = TokenEstimator::estimate_messages(&msgs);
        assert_eq!(total, 2 * (1 + 4));
    }
}
