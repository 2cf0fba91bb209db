//! 交易员管理器
//!
//! 进程内交易员集合的唯一所有者。每个交易员运行两个协作任务：
//! 决策周期循环与回撤监控。启动对running幂等、停止对stopped幂等；
//! 停止时发出信号并等待在途周期与监控结束，不打断进行中的交易所调用。

use std::collections::HashMap;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::AppError;
use crate::trading::trader::engine::AutoTrader;

/// 交易员运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderState {
    Stopped,
    Running,
    Stopping,
}

struct TraderHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    cycle_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

#[derive(Default)]
pub struct TraderManager {
    traders: Mutex<HashMap<String, TraderHandle>>,
}

impl TraderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动一个交易员：派生监控任务与周期任务。已在运行则幂等返回。
    pub async fn start(&self, trader: AutoTrader) -> Result<(), AppError> {
        let mut traders = self.traders.lock().await;
        let id = trader.id().to_string();
        if traders.contains_key(&id) {
            warn!("交易员 {} 已在运行，忽略重复启动", id);
            return Ok(());
        }

        let name = trader.name().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);

        let monitor = trader.monitor_handle();
        let monitor_task = tokio::spawn(monitor.run(stop_rx.clone()));
        let cycle_task = tokio::spawn(trader.run(stop_rx));

        info!("交易员 {} ({}) 已启动", name, id);
        traders.insert(
            id,
            TraderHandle {
                name,
                stop_tx,
                cycle_task,
                monitor_task,
            },
        );
        Ok(())
    }

    /// 停止一个交易员并等待其退出。未运行则幂等返回。
    pub async fn stop(&self, trader_id: &str) {
        let handle = {
            let mut traders = self.traders.lock().await;
            traders.remove(trader_id)
        };
        let Some(handle) = handle else {
            warn!("交易员 {} 未在运行，忽略停止请求", trader_id);
            return;
        };

        info!("正在停止交易员 {} ({})...", handle.name, trader_id);
        let _ = handle.stop_tx.send(true);
        let _ = handle.cycle_task.await;
        let _ = handle.monitor_task.await;
        info!("交易员 {} 已停止", trader_id);
    }

    pub async fn state(&self, trader_id: &str) -> TraderState {
        let traders = self.traders.lock().await;
        match traders.get(trader_id) {
            Some(handle) if *handle.stop_tx.borrow() => TraderState::Stopping,
            Some(_) => TraderState::Running,
            None => TraderState::Stopped,
        }
    }

    pub async fn running_ids(&self) -> Vec<String> {
        self.traders.lock().await.keys().cloned().collect()
    }

    /// 停止全部交易员（进程退出前调用）
    pub async fn stop_all(&self) {
        let ids = self.running_ids().await;
        for id in ids {
            self.stop(&id).await;
        }
    }
}
