//! 决策引擎
//!
//! 一个周期内的"感知→询问→解析"：为持仓与候选币拉取市场快照、
//! 构建两段提示词、调用AI网关、修复并解析JSON、做硬规则验证。

use std::time::Duration;

use tracing::{info, warn};

use crate::trading::ai::LlmApi;
use crate::trading::decision::prompt;
use crate::trading::decision::repair;
use crate::trading::decision::types::{Context, FullDecision};
use crate::trading::decision::validator;
use crate::trading::market::MarketDataSource;

/// 单个币种快照拉取的重试次数
const SNAPSHOT_RETRIES: u32 = 3;

/// 决策失败：即使失败也尽量携带已得到的prompt与思维链，供周期记录落盘
#[derive(Debug)]
pub struct DecisionFailure {
    pub partial: Option<FullDecision>,
    pub message: String,
}

impl std::fmt::Display for DecisionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// 为上下文中的持仓与候选币拉取市场快照。
/// 持仓币种必拉（退出决策依赖行情）；候选币按持仓数量截断；
/// 单币种最多重试3次，仍失败则静默丢弃该币种。
pub async fn fetch_market_data(ctx: &mut Context, market: &dyn MarketDataSource) {
    let mut symbols: Vec<String> = Vec::new();
    for pos in &ctx.positions {
        if !symbols.contains(&pos.symbol) {
            symbols.push(pos.symbol.clone());
        }
    }
    let cap = prompt::max_candidates(ctx.positions.len(), ctx.candidate_coins.len());
    for coin in ctx.candidate_coins.iter().take(cap) {
        if !symbols.contains(&coin.symbol) {
            symbols.push(coin.symbol.clone());
        }
    }

    for symbol in symbols {
        let mut fetched = None;
        for attempt in 1..=SNAPSHOT_RETRIES {
            match market.snapshot(&symbol).await {
                Ok(snapshot) => {
                    fetched = Some(snapshot);
                    break;
                }
                Err(e) if attempt < SNAPSHOT_RETRIES => {
                    warn!(
                        "获取 {} 市场数据失败（尝试 {}/{}）: {}",
                        symbol, attempt, SNAPSHOT_RETRIES, e
                    );
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => {
                    warn!("获取 {} 市场数据失败（已重试{}次）: {}", symbol, SNAPSHOT_RETRIES, e);
                }
            }
        }
        if let Some(snapshot) = fetched {
            ctx.market_map.insert(symbol, snapshot);
        }
    }
}

/// 获取AI的完整交易决策
pub async fn get_full_decision(
    ctx: &mut Context,
    llm: &dyn LlmApi,
    market: &dyn MarketDataSource,
    template_content: &str,
    custom_prompt: Option<&str>,
    override_base: bool,
) -> Result<FullDecision, DecisionFailure> {
    fetch_market_data(ctx, market).await;

    let system_prompt = prompt::build_system_prompt(
        template_content,
        ctx.btc_eth_leverage,
        ctx.altcoin_leverage,
        custom_prompt,
        override_base,
    );
    let user_prompt = prompt::build_user_prompt(ctx);

    let response = llm
        .call_with_messages(&system_prompt, &user_prompt)
        .await
        .map_err(|e| DecisionFailure {
            partial: Some(FullDecision {
                system_prompt: system_prompt.clone(),
                user_prompt: user_prompt.clone(),
                ..FullDecision::default()
            }),
            message: format!("调用AI API失败: {}", e),
        })?;

    let cot_trace = repair::extract_cot_trace(&response);
    let decisions = repair::extract_decisions(&response).map_err(|e| DecisionFailure {
        partial: Some(FullDecision {
            system_prompt: system_prompt.clone(),
            user_prompt: user_prompt.clone(),
            cot_trace: cot_trace.clone(),
            decisions: Vec::new(),
        }),
        message: format!("提取决策失败: {}", e),
    })?;

    let full = FullDecision {
        system_prompt,
        user_prompt,
        cot_trace,
        decisions,
    };

    if let Err(e) =
        validator::validate_decisions(&full.decisions, ctx.btc_eth_leverage, ctx.altcoin_leverage)
    {
        return Err(DecisionFailure {
            message: format!("决策验证失败: {}", e),
            partial: Some(full),
        });
    }

    info!("AI返回 {} 条决策", full.decisions.len());
    Ok(full)
}
