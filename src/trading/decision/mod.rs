//! 决策子系统：AI输出的解析、修复、验证与提示词构建

pub mod engine;
pub mod prompt;
pub mod repair;
pub mod types;
pub mod validator;

pub use engine::{get_full_decision, DecisionFailure};
pub use types::{
    action_priority, sort_decisions_by_priority, AccountInfo, Context, Decision, FullDecision,
    HistoryDecision, PerformanceSummary, PositionInfo,
};
