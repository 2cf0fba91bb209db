//! 决策数据结构
//!
//! Decision是AI输出的线格式DTO：先解析、再验证、再执行，内部类型
//! 不与线格式耦合。数值字段缺省时为unset（None），不是0。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::trading::market::MarketSnapshot;
use crate::trading::pool::CandidateCoin;

/// 可用动作全集
pub const VALID_ACTIONS: [&str; 9] = [
    "open_long",
    "open_short",
    "close_long",
    "close_short",
    "update_stop_loss",
    "update_take_profit",
    "partial_close",
    "hold",
    "wait",
];

/// AI的单条交易决策（线格式）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub action: String,

    // 开仓参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_size_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,

    // 调整参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_take_profit: Option<f64>,
    /// 用于 partial_close (0-100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_percentage: Option<f64>,

    // 通用参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

/// 执行优先级：先平仓释放保证金，再改止盈止损，再开新仓，观望最后。
/// 未知动作排在最后（验证阶段已拒绝，此处仅防御）。
pub fn action_priority(action: &str) -> u32 {
    match action {
        "close_long" | "close_short" | "partial_close" => 1,
        "update_stop_loss" | "update_take_profit" => 2,
        "open_long" | "open_short" => 3,
        "hold" | "wait" => 4,
        _ => 999,
    }
}

/// 按优先级稳定排序，同优先级保留AI给出的顺序
pub fn sort_decisions_by_priority(decisions: &[Decision]) -> Vec<Decision> {
    let mut sorted = decisions.to_vec();
    sorted.sort_by_key(|d| action_priority(&d.action));
    sorted
}

/// 账户信息（传递给AI）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// 持仓信息（传递给AI）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
    /// 持仓首次被观察到的时间（毫秒）
    pub first_seen_ms: i64,
}

/// 历史决策记录（用于连续性分析）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDecision {
    pub cycle_number: u64,
    pub timestamp: String,
    pub decisions: Vec<Decision>,
    pub cot_trace: String,
}

/// 历史表现摘要
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub analyzed_cycles: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
}

/// 交易上下文：一个周期内传递给AI的全部信息
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub current_time: String,
    pub runtime_minutes: i64,
    pub cycle_number: u64,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub account: AccountInfo,
    pub positions: Vec<PositionInfo>,
    pub candidate_coins: Vec<CandidateCoin>,
    /// 周期内拉取的市场快照，key为标准化symbol
    pub market_map: HashMap<String, MarketSnapshot>,
    pub performance: Option<PerformanceSummary>,
    pub history_decisions: Vec<HistoryDecision>,
}

/// AI的完整决策输出（含思维链）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullDecision {
    pub system_prompt: String,
    pub user_prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(action: &str, symbol: &str) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action: action.to_string(),
            ..Decision::default()
        }
    }

    #[test]
    fn test_priority_ranks() {
        assert_eq!(action_priority("close_long"), 1);
        assert_eq!(action_priority("partial_close"), 1);
        assert_eq!(action_priority("update_stop_loss"), 2);
        assert_eq!(action_priority("open_short"), 3);
        assert_eq!(action_priority("wait"), 4);
        assert_eq!(action_priority("bogus"), 999);
    }

    #[test]
    fn test_sort_close_before_open() {
        let input = vec![
            decision("open_short", "BTCUSDT"),
            decision("close_long", "BTCUSDT"),
            decision("wait", "ETHUSDT"),
        ];
        let sorted = sort_decisions_by_priority(&input);
        assert_eq!(sorted[0].action, "close_long");
        assert_eq!(sorted[1].action, "open_short");
        assert_eq!(sorted[2].action, "wait");
    }

    #[test]
    fn test_sort_is_stable_within_rank() {
        let input = vec![
            decision("open_long", "AAAUSDT"),
            decision("open_short", "BBBUSDT"),
            decision("open_long", "CCCUSDT"),
        ];
        let sorted = sort_decisions_by_priority(&input);
        let symbols: Vec<&str> = sorted.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAAUSDT", "BBBUSDT", "CCCUSDT"]);
    }

    #[test]
    fn test_decision_missing_numeric_fields_are_none() {
        let raw = r#"{"symbol":"BTCUSDT","action":"wait","reasoning":"观望"}"#;
        let d: Decision = serde_json::from_str(raw).unwrap();
        assert!(d.leverage.is_none());
        assert!(d.position_size_usd.is_none());
        assert!(d.close_percentage.is_none());
    }

    #[test]
    fn test_decision_null_numeric_fields_are_none() {
        let raw = r#"{"symbol":"BTCUSDT","action":"wait","leverage":null,"stop_loss":null}"#;
        let d: Decision = serde_json::from_str(raw).unwrap();
        assert!(d.leverage.is_none());
        assert!(d.stop_loss.is_none());
    }
}
