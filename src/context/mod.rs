//! 阶段上下文层：转录、token 估算与压缩

pub mod compaction;
pub mod estimator;
pub mod transcript;

pub use compaction::{compact, CompactionReport, SUMMARY_MARKER};
pub use estimator::TokenEstimator;
pub use transcript::{Message, PhaseContext, Role, Turn, TurnAction};
