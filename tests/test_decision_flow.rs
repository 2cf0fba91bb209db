//! 决策流程测试：候选截断、行情拉取失败的静默丢弃

mod common;

use std::sync::atomic::Ordering;

use ai_quant::trading::decision::engine::fetch_market_data;
use ai_quant::trading::decision::{Context, PositionInfo};
use ai_quant::trading::pool::CandidateCoin;

use common::FakeMarket;

fn candidate(symbol: &str) -> CandidateCoin {
    CandidateCoin {
        symbol: symbol.to_string(),
        sources: vec!["coin_pool".to_string()],
    }
}

fn held(symbol: &str) -> PositionInfo {
    PositionInfo {
        symbol: symbol.to_string(),
        side: "long".to_string(),
        entry_price: 100.0,
        mark_price: 100.0,
        quantity: 1.0,
        leverage: 5,
        unrealized_pnl: 0.0,
        unrealized_pnl_pct: 0.0,
        liquidation_price: 80.0,
        margin_used: 20.0,
        first_seen_ms: 0,
    }
}

fn candidates(n: usize) -> Vec<CandidateCoin> {
    (0..n).map(|i| candidate(&format!("C{:03}USDT", i))).collect()
}

/// 无持仓时候选币截断到30个
#[tokio::test(start_paused = true)]
async fn test_candidates_trimmed_to_30_when_flat() {
    let market = FakeMarket::new();
    let mut ctx = Context {
        candidate_coins: candidates(40),
        ..Context::default()
    };
    fetch_market_data(&mut ctx, &market).await;
    assert_eq!(ctx.market_map.len(), 30);
    assert_eq!(market.snapshot_count.load(Ordering::SeqCst), 30);
}

/// 3个持仓时候选币截断到15个，持仓币种无条件拉取
#[tokio::test(start_paused = true)]
async fn test_candidates_trimmed_to_15_with_three_positions() {
    let market = FakeMarket::new();
    let mut ctx = Context {
        positions: vec![held("AAAUSDT"), held("BBBUSDT"), held("CCCUSDT")],
        candidate_coins: candidates(40),
        ..Context::default()
    };
    fetch_market_data(&mut ctx, &market).await;
    // 3个持仓 + 15个候选
    assert_eq!(ctx.market_map.len(), 18);
    assert!(ctx.market_map.contains_key("AAAUSDT"));
    assert!(ctx.market_map.contains_key("BBBUSDT"));
    assert!(ctx.market_map.contains_key("CCCUSDT"));
}

/// 行情持续失败的币种重试3次后静默丢弃，不影响其他币种
#[tokio::test(start_paused = true)]
async fn test_failing_symbol_dropped_silently() {
    let market = FakeMarket::new();
    market.failing.lock().await.push("BADUSDT".to_string());
    let mut ctx = Context {
        candidate_coins: vec![candidate("GOODUSDT"), candidate("BADUSDT")],
        ..Context::default()
    };
    fetch_market_data(&mut ctx, &market).await;
    assert!(ctx.market_map.contains_key("GOODUSDT"));
    assert!(!ctx.market_map.contains_key("BADUSDT"));
    // 1次成功 + 3次失败重试
    assert_eq!(market.snapshot_count.load(Ordering::SeqCst), 4);
}

/// 持仓币种同时在候选列表中只拉取一次
#[tokio::test(start_paused = true)]
async fn test_held_symbol_not_fetched_twice() {
    let market = FakeMarket::new();
    let mut ctx = Context {
        positions: vec![held("AAAUSDT")],
        candidate_coins: vec![candidate("AAAUSDT"), candidate("BBBUSDT")],
        ..Context::default()
    };
    fetch_market_data(&mut ctx, &market).await;
    assert_eq!(market.snapshot_count.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.market_map.len(), 2);
}
