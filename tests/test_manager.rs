//! 交易员管理器的生命周期测试

mod common;

use std::sync::Arc;

use ai_quant::trading::journal::DecisionJournal;
use ai_quant::trading::pool::SignalSources;
use ai_quant::trading::trader::{AutoTrader, TraderManager, TraderState};

use common::{test_config, FakeLlm, TestRig};

fn make_trader(rig: &TestRig, id: &str) -> AutoTrader {
    let journal = Arc::new(DecisionJournal::new(rig.tmp.path(), id).unwrap());
    AutoTrader::new(
        test_config(id),
        rig.exchange.clone(),
        Arc::new(FakeLlm::new(vec![])),
        rig.market.clone(),
        rig.store.clone(),
        Arc::new(SignalSources::disabled()),
        journal,
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_start_stop_lifecycle() {
    let rig = TestRig::new(100.0);
    let manager = TraderManager::new();

    assert_eq!(manager.state("t1").await, TraderState::Stopped);

    manager.start(make_trader(&rig, "t1")).await.unwrap();
    assert_eq!(manager.state("t1").await, TraderState::Running);

    // 重复启动幂等
    manager.start(make_trader(&rig, "t1")).await.unwrap();
    assert_eq!(manager.running_ids().await.len(), 1);

    manager.stop("t1").await;
    assert_eq!(manager.state("t1").await, TraderState::Stopped);

    // 重复停止幂等
    manager.stop("t1").await;
    assert_eq!(manager.state("t1").await, TraderState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_all() {
    let rig = TestRig::new(100.0);
    let manager = TraderManager::new();
    manager.start(make_trader(&rig, "a")).await.unwrap();
    manager.start(make_trader(&rig, "b")).await.unwrap();
    assert_eq!(manager.running_ids().await.len(), 2);

    manager.stop_all().await;
    assert!(manager.running_ids().await.is_empty());
}
