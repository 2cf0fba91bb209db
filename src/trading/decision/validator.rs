//! 决策验证
//!
//! 逐条做结构与硬风控校验，一条不合法整个列表拒绝（不执行任何动作）。
//! 经济性校验（风险回报比、爆仓距离）不在这里重复——那是适配器下单前
//! 校验与提示词的职责，避免两处规则不一致。

use super::types::{Decision, VALID_ACTIONS};
use crate::error::AppError;

/// 验证整个决策列表；校验逐条独立、与顺序无关
pub fn validate_decisions(
    decisions: &[Decision],
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
) -> Result<(), AppError> {
    for (i, decision) in decisions.iter().enumerate() {
        validate_decision(decision, btc_eth_leverage, altcoin_leverage)
            .map_err(|e| AppError::DecisionError(format!("决策 #{} 验证失败: {}", i + 1, e)))?;
    }
    Ok(())
}

/// 该币种适用的杠杆上限
pub fn leverage_ceiling(symbol: &str, btc_eth_leverage: u32, altcoin_leverage: u32) -> u32 {
    if symbol == "BTCUSDT" || symbol == "ETHUSDT" {
        btc_eth_leverage
    } else {
        altcoin_leverage
    }
}

fn validate_decision(
    d: &Decision,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
) -> Result<(), String> {
    if !VALID_ACTIONS.contains(&d.action.as_str()) {
        return Err(format!("无效的action: {}", d.action));
    }

    match d.action.as_str() {
        "open_long" | "open_short" => {
            let max_leverage = leverage_ceiling(&d.symbol, btc_eth_leverage, altcoin_leverage);
            let leverage = d.leverage.ok_or("开仓必须提供leverage")?;
            if leverage == 0 || leverage > max_leverage {
                return Err(format!(
                    "杠杆必须在1-{}之间（{}，当前配置上限{}倍）: {}",
                    max_leverage, d.symbol, max_leverage, leverage
                ));
            }
            let size = d.position_size_usd.ok_or("开仓必须提供position_size_usd")?;
            if size <= 0.0 {
                return Err(format!("仓位价值必须大于0: {:.2}", size));
            }
        }
        "update_stop_loss" => {
            let price = d.new_stop_loss.ok_or("必须提供new_stop_loss")?;
            if price <= 0.0 {
                return Err(format!("新止损价格必须大于0: {:.2}", price));
            }
        }
        "update_take_profit" => {
            let price = d.new_take_profit.ok_or("必须提供new_take_profit")?;
            if price <= 0.0 {
                return Err(format!("新止盈价格必须大于0: {:.2}", price));
            }
        }
        "partial_close" => {
            let pct = d.close_percentage.ok_or("必须提供close_percentage")?;
            if pct <= 0.0 || pct > 100.0 {
                return Err(format!("平仓百分比必须在0-100之间: {:.1}", pct));
            }
        }
        // close/hold/wait只需要reasoning，数值字段可缺省
        _ => {}
    }

    Ok(())
}
