//! 交易员周期的端到端场景测试（fake交易所 + 脚本化AI）

mod common;

use std::sync::Arc;

use ai_quant::trading::ai::LlmApi;
use ai_quant::trading::config::TraderConfig;
use ai_quant::trading::exchange::{ExchangeTrader, PosSide};
use ai_quant::trading::journal::DecisionJournal;
use ai_quant::trading::pool::SignalSources;
use ai_quant::trading::trader::AutoTrader;

use common::{position, test_config, FailingLlm, FakeLlm, TestRig};

fn make_trader(rig: &TestRig, llm: Arc<dyn LlmApi>, config: TraderConfig) -> AutoTrader {
    let journal =
        Arc::new(DecisionJournal::new(rig.tmp.path(), &config.id).expect("创建journal失败"));
    make_trader_with_journal(rig, llm, config, journal)
}

fn make_trader_with_journal(
    rig: &TestRig,
    llm: Arc<dyn LlmApi>,
    config: TraderConfig,
    journal: Arc<DecisionJournal>,
) -> AutoTrader {
    AutoTrader::new(
        config,
        rig.exchange.clone(),
        llm,
        rig.market.clone(),
        rig.store.clone(),
        Arc::new(SignalSources::disabled()),
        journal,
    )
    .expect("创建AutoTrader失败")
}

/// 换仓场景：持有BTC多仓，AI给出乱序的[开空, 平多]，
/// 执行顺序必须是先平多（释放保证金）后开空，最终只剩一个空仓。
#[tokio::test(start_paused = true)]
async fn test_swap_scenario_close_before_open() {
    let rig = TestRig::new(40.0);
    rig.exchange.set_mark_price("BTCUSDT", 60000.0).await;
    rig.exchange
        .add_position(position("BTCUSDT", PosSide::Long, 0.01, 60000.0, 10))
        .await;
    rig.market.set_price("BTCUSDT", 60000.0).await;

    // AI故意把open放在close前面
    let llm = Arc::new(FakeLlm::new(vec![
        r#"趋势转弱，先平多再反手做空。
[{"symbol":"BTCUSDT","action":"open_short","leverage":10,"position_size_usd":600,"stop_loss":62000,"take_profit":56000,"confidence":80,"reasoning":"反手做空"},
{"symbol":"BTCUSDT","action":"close_long","reasoning":"趋势转弱"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.expect("周期执行失败");

    // 周期记录：两个动作按 close -> open 顺序且均成功
    let record = journal.latest_records(1).remove(0);
    assert!(record.success);
    assert_eq!(record.actions.len(), 2);
    assert_eq!(record.actions[0].action, "close_long");
    assert!(record.actions[0].success);
    assert_eq!(record.actions[1].action, "open_short");
    assert!(record.actions[1].success);
    assert!(!record.actions[1].order_id.is_empty());

    // 交易所调用顺序一致
    let mutations = rig.exchange.mutation_log().await;
    let close_idx = mutations
        .iter()
        .position(|c| c.starts_with("close BTCUSDT long"))
        .expect("缺少平仓调用");
    let open_idx = mutations
        .iter()
        .position(|c| c.starts_with("open BTCUSDT short"))
        .expect("缺少开仓调用");
    assert!(close_idx < open_idx, "必须先平仓后开仓: {:?}", mutations);

    // 开仓成功后持仓必须可见：只剩一个空仓
    let positions = rig.exchange.get_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, PosSide::Short);
    assert!(positions[0].quantity > 0.0);
}

/// 空仓观望：wait不触发任何交易所变更，周期记录一个成功的wait动作
#[tokio::test(start_paused = true)]
async fn test_wait_cycle_no_mutation() {
    let rig = TestRig::new(100.0);
    let llm = Arc::new(FakeLlm::new(vec![
        r#"[{"symbol":"ALL","action":"wait","reasoning":"行情不明朗"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.unwrap();

    let record = journal.latest_records(1).remove(0);
    assert!(record.success);
    assert_eq!(record.actions.len(), 1);
    assert_eq!(record.actions[0].action, "wait");
    assert!(record.actions[0].success);
    assert!(rig.exchange.mutation_log().await.is_empty());

    // 下一周期正常触发且编号连续
    trader.run_cycle().await.unwrap();
    let records = journal.latest_records(10);
    let cycles: Vec<u64> = records.iter().map(|r| r.cycle_number).collect();
    assert_eq!(cycles, vec![1, 2]);
}

/// 验证拒绝：杠杆0的开仓决策整体拒绝，不执行任何动作
#[tokio::test(start_paused = true)]
async fn test_validator_rejection_aborts_cycle() {
    let rig = TestRig::new(100.0);
    let llm = Arc::new(FakeLlm::new(vec![
        r#"[{"symbol":"ETHUSDT","action":"open_long","leverage":0,"position_size_usd":100,"stop_loss":100,"take_profit":200,"reasoning":"错误决策"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    assert!(trader.run_cycle().await.is_err());

    let record = journal.latest_records(1).remove(0);
    assert!(!record.success);
    assert!(record.error_message.contains("杠杆"), "{}", record.error_message);
    assert!(record.actions.is_empty());
    assert!(rig.exchange.mutation_log().await.is_empty());
}

/// AI调用失败：周期记录失败原因，下一周期照常进行
#[tokio::test(start_paused = true)]
async fn test_llm_failure_records_and_continues() {
    let rig = TestRig::new(100.0);
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader =
        make_trader_with_journal(&rig, Arc::new(FailingLlm), test_config("t1"), journal.clone());

    assert!(trader.run_cycle().await.is_err());
    let record = journal.latest_records(1).remove(0);
    assert!(!record.success);
    assert!(record.error_message.contains("调用AI API失败"));
    // prompt即使失败也要落盘，便于离线诊断
    assert!(!record.input_prompt.is_empty());
}

/// 余额自动同步：实际可用余额偏离声明值超过5%时替换并回写配置存储
#[tokio::test]
async fn test_balance_auto_resync() {
    let rig = TestRig::new(120.0);
    let llm = Arc::new(FakeLlm::new(vec![]));
    let mut trader = make_trader(&rig, llm, test_config("t1"));

    assert!((trader.initial_balance() - 100.0).abs() < 1e-9);
    trader.auto_sync_balance().await;
    assert!((trader.initial_balance() - 120.0).abs() < 1e-9);

    let updates = rig.store.balance_updates.lock().await.clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "t1");
    assert!((updates[0].1 - 120.0).abs() < 1e-9);
}

/// 余额变化不足5%时不更新
#[tokio::test]
async fn test_balance_sync_small_change_ignored() {
    let rig = TestRig::new(103.0);
    let llm = Arc::new(FakeLlm::new(vec![]));
    let mut trader = make_trader(&rig, llm, test_config("t1"));

    trader.auto_sync_balance().await;
    assert!((trader.initial_balance() - 100.0).abs() < 1e-9);
    assert!(rig.store.balance_updates.lock().await.is_empty());
}

/// 全角JSON响应经修复后正常解析为一条wait决策
#[tokio::test(start_paused = true)]
async fn test_full_width_json_repaired() {
    let rig = TestRig::new(100.0);
    let llm = Arc::new(FakeLlm::new(vec![
        "［｛\"action\":\"wait\",\"leverage\":\"\",\"reasoning\":\"观望\"｝］",
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.unwrap();
    let record = journal.latest_records(1).remove(0);
    assert!(record.success);
    assert_eq!(record.decisions.len(), 1);
    assert_eq!(record.decisions[0].action, "wait");
}

/// 首次见仓时间：出现即记录，消失后最迟下一周期清理
#[tokio::test(start_paused = true)]
async fn test_first_seen_lifecycle() {
    let rig = TestRig::new(100.0);
    rig.exchange
        .add_position(position("SOLUSDT", PosSide::Long, 10.0, 150.0, 5))
        .await;
    rig.market.set_price("SOLUSDT", 150.0).await;
    let llm = Arc::new(FakeLlm::new(vec![]));
    let mut trader = make_trader(&rig, llm, test_config("t1"));

    trader.run_cycle().await.unwrap();
    let seen = trader.first_seen_snapshot();
    assert!(seen.contains_key("SOLUSDT_long"));
    let first_value = seen["SOLUSDT_long"];
    assert!(first_value > 0);

    // 同一持仓第二个周期不改写首次时间
    trader.run_cycle().await.unwrap();
    assert_eq!(trader.first_seen_snapshot()["SOLUSDT_long"], first_value);

    // 持仓消失后清理
    rig.exchange.positions.lock().await.clear();
    trader.run_cycle().await.unwrap();
    assert!(!trader.first_seen_snapshot().contains_key("SOLUSDT_long"));
}

/// 幽灵持仓（数量为0）不出现在任何上层视图
#[tokio::test(start_paused = true)]
async fn test_ghost_position_suppressed() {
    let rig = TestRig::new(100.0);
    rig.exchange
        .add_position(position("DOGEUSDT", PosSide::Long, 0.0, 0.1, 5))
        .await;
    let llm = Arc::new(FakeLlm::new(vec![]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.unwrap();
    let record = journal.latest_records(1).remove(0);
    assert_eq!(record.account.position_count, 0);
    assert!(record.positions.is_empty());
    assert!(trader.first_seen_snapshot().is_empty());
}

/// 风控暂停：暂停期内跳过周期并记录原因，不调用AI
#[tokio::test(start_paused = true)]
async fn test_halt_skips_cycle() {
    let rig = TestRig::new(100.0);
    let llm = Arc::new(FakeLlm::new(vec![]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader =
        make_trader_with_journal(&rig, llm.clone(), test_config("t1"), journal.clone());

    trader.halt();
    trader.run_cycle().await.unwrap();

    let record = journal.latest_records(1).remove(0);
    assert!(!record.success);
    assert!(record.error_message.contains("风险控制"));
    assert!(llm.calls.lock().await.is_empty());
}

/// 周期编号跨重启保持严格递增且连续
#[tokio::test(start_paused = true)]
async fn test_cycle_numbers_contiguous_across_restart() {
    let rig = TestRig::new(100.0);
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());

    let mut trader = make_trader_with_journal(
        &rig,
        Arc::new(FakeLlm::new(vec![])),
        test_config("t1"),
        journal.clone(),
    );
    trader.run_cycle().await.unwrap();
    trader.run_cycle().await.unwrap();
    drop(trader);

    // 重启：新实例从journal恢复周期号
    let mut restarted = make_trader_with_journal(
        &rig,
        Arc::new(FakeLlm::new(vec![])),
        test_config("t1"),
        journal.clone(),
    );
    restarted.run_cycle().await.unwrap();

    let cycles: Vec<u64> = journal
        .latest_records(10)
        .iter()
        .map(|r| r.cycle_number)
        .collect();
    assert_eq!(cycles, vec![1, 2, 3]);
}

/// 部分平仓：按百分比折算数量
#[tokio::test(start_paused = true)]
async fn test_partial_close_quantity() {
    let rig = TestRig::new(100.0);
    rig.exchange.set_mark_price("SOLUSDT", 150.0).await;
    rig.exchange
        .add_position(position("SOLUSDT", PosSide::Long, 10.0, 150.0, 5))
        .await;
    rig.market.set_price("SOLUSDT", 150.0).await;

    let llm = Arc::new(FakeLlm::new(vec![
        r#"[{"symbol":"SOLUSDT","action":"partial_close","close_percentage":40,"reasoning":"落袋部分利润"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.unwrap();
    let record = journal.latest_records(1).remove(0);
    assert!(record.success);
    assert!((record.actions[0].quantity - 4.0).abs() < 1e-9);

    let positions = rig.exchange.get_positions().await.unwrap();
    assert!((positions[0].quantity - 6.0).abs() < 1e-9);
}

/// 调整止损：只取消止损侧，再设置新价
#[tokio::test(start_paused = true)]
async fn test_update_stop_loss_flow() {
    let rig = TestRig::new(100.0);
    rig.exchange.set_mark_price("SOLUSDT", 150.0).await;
    rig.exchange
        .add_position(position("SOLUSDT", PosSide::Long, 10.0, 140.0, 5))
        .await;
    rig.market.set_price("SOLUSDT", 150.0).await;

    let llm = Arc::new(FakeLlm::new(vec![
        r#"[{"symbol":"SOLUSDT","action":"update_stop_loss","new_stop_loss":145,"reasoning":"上移止损保护利润"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.unwrap();
    let record = journal.latest_records(1).remove(0);
    assert!(record.success, "{:?}", record.error_message);

    let calls = rig.exchange.call_log().await;
    assert!(calls.iter().any(|c| c.starts_with("cancel_stop_loss SOLUSDT")));
    assert!(calls.iter().any(|c| c.starts_with("set_stop_loss SOLUSDT long 145")));
    // 止盈侧不受影响
    assert!(!calls.iter().any(|c| c.starts_with("cancel_take_profit")));
}

/// 调整止损时持仓不存在：动作级错误，周期继续
#[tokio::test(start_paused = true)]
async fn test_update_stop_loss_without_position() {
    let rig = TestRig::new(100.0);
    let llm = Arc::new(FakeLlm::new(vec![
        r#"[{"symbol":"SOLUSDT","action":"update_stop_loss","new_stop_loss":145,"reasoning":"无仓可调"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    // 动作失败不中断周期
    trader.run_cycle().await.unwrap();
    let record = journal.latest_records(1).remove(0);
    assert!(!record.success);
    assert_eq!(record.actions.len(), 1);
    assert!(!record.actions[0].success);
    assert!(record.actions[0].error.contains("持仓不存在"));
}

/// 重复开仓被适配器拒绝，错误落入动作记录
#[tokio::test(start_paused = true)]
async fn test_duplicate_open_rejected() {
    let rig = TestRig::new(1000.0);
    rig.exchange.set_mark_price("BTCUSDT", 60000.0).await;
    rig.exchange
        .add_position(position("BTCUSDT", PosSide::Long, 0.01, 60000.0, 10))
        .await;
    rig.market.set_price("BTCUSDT", 60000.0).await;

    let llm = Arc::new(FakeLlm::new(vec![
        r#"[{"symbol":"BTCUSDT","action":"open_long","leverage":10,"position_size_usd":600,"stop_loss":58000,"take_profit":66000,"confidence":70,"reasoning":"加仓"}]"#,
    ]));
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), "t1").unwrap());
    let mut trader = make_trader_with_journal(&rig, llm, test_config("t1"), journal.clone());

    trader.run_cycle().await.unwrap();
    let record = journal.latest_records(1).remove(0);
    assert!(!record.success);
    assert!(record.actions[0].error.contains("已有"), "{}", record.actions[0].error);
    // 仍然只有一个持仓
    assert_eq!(rig.exchange.get_positions().await.unwrap().len(), 1);
}
