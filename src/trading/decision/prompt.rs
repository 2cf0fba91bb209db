//! 提示词构建
//!
//! System Prompt是(模板, 杠杆配置)的纯函数：模板正文 + 硬规则尾部。
//! User Prompt携带全部动态数据：账户、持仓、候选币种行情、历史决策。
//! 两段分离，便于将来做prompt缓存。

use std::fmt::Write as _;

use crate::time_util;
use crate::trading::decision::types::Context;

/// 内置默认模板（配置存储缺失模板时的兜底）
pub const BUILTIN_DEFAULT_TEMPLATE: &str = "你是专业的加密货币永续合约交易AI，完全自主决策。\
你在每个周期收到账户状态、持仓与候选币种的技术指标数据，输出思维链分析和一个JSON决策数组。\
追求风险调整后的长期收益，严格使用止损保护每一笔仓位。";

/// 无持仓/持仓1/2/3+时的候选币分析上限
const MAX_CANDIDATES_BY_POSITIONS: [usize; 4] = [30, 25, 20, 15];

/// 根据持仓数量计算本周期分析的候选币数量上限
pub fn max_candidates(position_count: usize, candidate_count: usize) -> usize {
    let cap = MAX_CANDIDATES_BY_POSITIONS[position_count.min(3)];
    candidate_count.min(cap)
}

/// 构建System Prompt：模板正文 + 硬规则尾部，支持自定义策略追加或整体覆盖
pub fn build_system_prompt(
    template_content: &str,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
    custom_prompt: Option<&str>,
    override_base: bool,
) -> String {
    if override_base {
        if let Some(custom) = custom_prompt {
            if !custom.is_empty() {
                return custom.to_string();
            }
        }
    }

    let mut sb = String::new();
    sb.push_str(template_content);
    sb.push_str("\n\n");

    sb.push_str("# 核心规则\n\n");
    let _ = writeln!(
        sb,
        "- 风险回报比≥3:1 | 杠杆: 山寨币≤{}x, BTC/ETH≤{}x | 最多3个持仓",
        altcoin_leverage, btc_eth_leverage
    );
    sb.push_str("- 开仓: 最小20%账户净值，推荐50-80%账户净值\n");
    sb.push_str("- 爆仓价: 做多=入场×(1-1/杠杆), 做空=入场×(1+1/杠杆)\n");
    sb.push_str("- 止损必须在爆仓价上方，否则止损失效\n\n");

    sb.push_str("# 可用动作\n\n");
    sb.push_str(
        "open_long/open_short/close_long/close_short/partial_close/update_stop_loss/update_take_profit/hold/wait\n\n",
    );

    sb.push_str("# 输出格式\n\n");
    sb.push_str("JSON数组: action, symbol, leverage, position_size_usd, stop_loss, take_profit, confidence(0-100), reasoning\n");
    sb.push_str("开仓必填: leverage, position_size_usd, stop_loss, take_profit, confidence, reasoning\n");
    sb.push_str("wait/hold/close操作: 可省略开仓字段或设为null\n");
    sb.push_str("position_size_usd是仓位价值，保证金=position_size_usd/leverage\n\n");

    if let Some(custom) = custom_prompt {
        if !custom.is_empty() {
            sb.push_str("# 个性化交易策略\n\n");
            sb.push_str(custom);
            sb.push_str("\n\n注意: 以上个性化策略是对基础规则的补充，不能违背基础风险控制原则。\n");
        }
    }

    sb
}

/// 构建User Prompt（动态数据）
pub fn build_user_prompt(ctx: &Context) -> String {
    let mut sb = String::new();

    // 系统状态
    let _ = writeln!(
        sb,
        "【时间】{} | 周期#{} | 运行{}分钟\n",
        ctx.current_time, ctx.cycle_number, ctx.runtime_minutes
    );

    // 账户信息
    sb.push_str("【账户信息】\n");
    let _ = writeln!(sb, "  账户净值: {:.2} USDT", ctx.account.total_equity);
    let available_pct = if ctx.account.total_equity > 0.0 {
        ctx.account.available_balance / ctx.account.total_equity * 100.0
    } else {
        0.0
    };
    let _ = writeln!(
        sb,
        "  可用余额: {:.2} USDT ({:.1}%)",
        ctx.account.available_balance, available_pct
    );
    let _ = writeln!(
        sb,
        "  已用保证金: {:.2} USDT ({:.1}%)",
        ctx.account.margin_used, ctx.account.margin_used_pct
    );
    let _ = writeln!(
        sb,
        "  总盈亏: {:+.2} USDT ({:+.2}%)",
        ctx.account.total_pnl, ctx.account.total_pnl_pct
    );
    let _ = writeln!(sb, "  当前持仓数: {}个", ctx.account.position_count);

    // 可开仓金额（基于可用余额和杠杆上限）
    if ctx.account.available_balance > 0.0 {
        let avail = ctx.account.available_balance;
        sb.push_str("  可开仓金额（基于可用余额）:\n");
        let _ = writeln!(
            sb,
            "     - 山寨币: 最多{:.2} USDT仓位价值（可用{:.2} × {}x杠杆）",
            avail * ctx.altcoin_leverage as f64,
            avail,
            ctx.altcoin_leverage
        );
        let _ = writeln!(
            sb,
            "     - BTC/ETH: 最多{:.2} USDT仓位价值（可用{:.2} × {}x杠杆）",
            avail * ctx.btc_eth_leverage as f64,
            avail,
            ctx.btc_eth_leverage
        );
    }
    sb.push('\n');

    // BTC市场概览
    if let Some(btc) = ctx.market_map.get("BTCUSDT") {
        sb.push_str("【BTC市场】\n");
        let _ = writeln!(sb, "  价格: {:.2} USDT", btc.current_price);
        let _ = writeln!(
            sb,
            "  1小时: {:+.2}% | 4小时: {:+.2}%",
            btc.price_change_1h, btc.price_change_4h
        );
        let _ = writeln!(
            sb,
            "  MACD: {:.4} | RSI: {:.1} | EMA20: {:.2}\n",
            btc.current_macd, btc.current_rsi7, btc.current_ema20
        );
    }

    // 当前持仓
    if ctx.positions.is_empty() {
        sb.push_str("【当前持仓】无\n\n");
    } else {
        sb.push_str("【当前持仓】\n");
        let now_ms = chrono::Utc::now().timestamp_millis();
        for (i, pos) in ctx.positions.iter().enumerate() {
            let holding = if pos.first_seen_ms > 0 {
                time_util::format_holding_duration((now_ms - pos.first_seen_ms) / 60_000)
            } else {
                String::new()
            };
            let position_value = pos.quantity * pos.mark_price;
            let margin_used = position_value / pos.leverage.max(1) as f64;
            let mut price_change_pct = (pos.mark_price - pos.entry_price) / pos.entry_price * 100.0;
            if pos.side == "short" {
                price_change_pct = -price_change_pct;
            }

            let _ = writeln!(sb, "{}. {} {}", i + 1, pos.symbol, pos.side.to_uppercase());
            let _ = writeln!(
                sb,
                "   入场价: {:.4} USDT | 当前价: {:.4} USDT | 价格变化: {:+.2}%",
                pos.entry_price, pos.mark_price, price_change_pct
            );
            let _ = writeln!(
                sb,
                "   数量: {:.8} | 仓位价值: {:.2} USDT | 杠杆: {}x | 保证金: {:.2} USDT",
                pos.quantity, position_value, pos.leverage, margin_used
            );
            let _ = writeln!(
                sb,
                "   未实现盈亏: {:+.2} USDT ({:+.2}%)",
                pos.unrealized_pnl, pos.unrealized_pnl_pct
            );
            let _ = writeln!(
                sb,
                "   爆仓价: {:.4} USDT | 持仓时长: {}",
                pos.liquidation_price, holding
            );
            if let Some(data) = ctx.market_map.get(&pos.symbol) {
                let _ = writeln!(
                    sb,
                    "   市场数据: EMA20={:.2} MACD={:.4} RSI={:.1} | 1h:{:+.2}% 4h:{:+.2}%",
                    data.current_ema20,
                    data.current_macd,
                    data.current_rsi7,
                    data.price_change_1h,
                    data.price_change_4h
                );
            }
            sb.push('\n');
        }
    }

    // 候选币种行情
    let _ = writeln!(sb, "【候选币种市场数据】（{}个）", ctx.market_map.len());
    let mut displayed = 0usize;
    for coin in &ctx.candidate_coins {
        let Some(data) = ctx.market_map.get(&coin.symbol) else {
            continue;
        };
        displayed += 1;

        let source_tag = if coin.sources.len() > 1 {
            "[多源]"
        } else if coin.sources.first().map(|s| s.as_str()) == Some("oi_top") {
            "[OI]"
        } else {
            ""
        };

        let _ = writeln!(sb, "{}. {} {}", displayed, coin.symbol, source_tag);
        let _ = writeln!(
            sb,
            "   价格: {:.4} USDT | EMA20: {:.4} | MACD: {:.4} | RSI: {:.1}",
            data.current_price, data.current_ema20, data.current_macd, data.current_rsi7
        );
        let _ = writeln!(
            sb,
            "   1小时: {:+.2}% | 4小时: {:+.2}%",
            data.price_change_1h, data.price_change_4h
        );
        if data.longer_term.atr14 > 0.0 {
            let _ = writeln!(sb, "   ATR14: {:.4}", data.longer_term.atr14);
        }
        if data.bollinger.middle > 0.0 {
            let _ = writeln!(
                sb,
                "   布林带: 上轨={:.4} 中轨={:.4} 下轨={:.4}",
                data.bollinger.upper, data.bollinger.middle, data.bollinger.lower
            );
        }
        if data.funding_rate != 0.0 {
            let _ = writeln!(sb, "   资金费率: {:+.4}%", data.funding_rate * 100.0);
        }
        sb.push('\n');
    }
    sb.push('\n');

    // 历史表现
    if let Some(perf) = &ctx.performance {
        let _ = writeln!(sb, "【历史表现】夏普比率: {:.2}\n", perf.sharpe_ratio);
    }

    // 历史决策记录（从旧到新，最多3条）
    if !ctx.history_decisions.is_empty() {
        sb.push_str("【历史决策记录】\n");
        for hist in &ctx.history_decisions {
            if hist.decisions.is_empty() {
                let _ = writeln!(sb, "  周期#{} ({}): wait", hist.cycle_number, hist.timestamp);
                continue;
            }
            let summary: Vec<String> = hist
                .decisions
                .iter()
                .map(|d| match d.action.as_str() {
                    "open_long" => format!("{}开多({}x)", d.symbol, d.leverage.unwrap_or(0)),
                    "open_short" => format!("{}开空({}x)", d.symbol, d.leverage.unwrap_or(0)),
                    "close_long" => format!("{}平多", d.symbol),
                    "close_short" => format!("{}平空", d.symbol),
                    "wait" | "hold" => d.action.clone(),
                    other => format!("{}{}", d.symbol, other),
                })
                .collect();
            let _ = writeln!(
                sb,
                "  周期#{} ({}): {}",
                hist.cycle_number,
                hist.timestamp,
                summary.join(", ")
            );
        }

        // 最近一次开仓决策的实际结果：仍持有则报告当前盈亏，否则标记已平仓
        if let Some(last) = ctx.history_decisions.last() {
            let mut results = Vec::new();
            for d in &last.decisions {
                if d.action != "open_long" && d.action != "open_short" {
                    continue;
                }
                match ctx.positions.iter().find(|p| p.symbol == d.symbol) {
                    Some(pos) => {
                        results.push(format!("{}:{:+.1}%", d.symbol, pos.unrealized_pnl_pct))
                    }
                    None => results.push(format!("{}:已平仓", d.symbol)),
                }
            }
            if !results.is_empty() {
                let _ = writeln!(sb, "  结果: {}", results.join(", "));
            }
        }
        sb.push('\n');
    }

    // 决策要求
    sb.push_str("【决策要求】\n");
    sb.push_str("1. 仔细分析账户信息（本金、可用余额、已用保证金）\n");
    sb.push_str("2. 分析当前持仓状态（盈亏、爆仓价、持仓时长）\n");
    sb.push_str("3. 评估候选币种市场数据（价格、技术指标、趋势）\n");
    sb.push_str("4. 确保止损价在爆仓价上方，防止止损失效\n");
    sb.push_str("5. 基于可用余额和杠杆计算可开仓金额\n");
    sb.push_str("6. 保持决策连续性，参考历史决策结果\n");
    sb.push_str("7. 输出思维链分析 + JSON格式决策\n\n");
    sb.push_str("---\n请分析以上信息，输出决策（思维链+JSON）\n");

    sb
}
