//! 持仓回撤监控
//!
//! 独立于AI决策周期的并行任务，每分钟轮询一次持仓，维护每个symbol的
//! 峰值收益率。收益大于5%且从峰值回撤达到40%时市价全平该方向，随后
//! 清除该symbol的峰值记录。监控只平仓，从不开仓。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::trading::exchange::{ExchangeTrader, PosSide, Position};

/// 轮询间隔
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(60);
/// 触发平仓的最低收益（百分比）
const MIN_PROFIT_PCT: f64 = 5.0;
/// 触发平仓的回撤阈值（百分比）
const DRAWDOWN_THRESHOLD_PCT: f64 = 40.0;

/// 基于杠杆的当前收益率（百分比）：做多 ((mark-entry)/entry)×lev×100，做空取反
pub fn leveraged_return_pct(position: &Position) -> f64 {
    if position.entry_price <= 0.0 {
        return 0.0;
    }
    let raw = (position.mark_price - position.entry_price) / position.entry_price;
    let signed = match position.side {
        PosSide::Long => raw,
        PosSide::Short => -raw,
    };
    signed * position.leverage.max(1) as f64 * 100.0
}

/// 从峰值回撤的百分比；峰值未达正值或当前不低于峰值时为0
pub fn drawdown_pct(peak: f64, current: f64) -> f64 {
    if peak > 0.0 && current < peak {
        (peak - current) / peak * 100.0
    } else {
        0.0
    }
}

/// 回撤平仓判定：收益须大于5%，且回撤达到40%（恰好40%触发）
pub fn should_emergency_close(current: f64, peak: f64) -> bool {
    current > MIN_PROFIT_PCT && drawdown_pct(peak, current) >= DRAWDOWN_THRESHOLD_PCT
}

pub struct DrawdownMonitor {
    trader_name: String,
    exchange: Arc<dyn ExchangeTrader>,
    /// 峰值收益缓存 symbol -> 峰值收益率
    peak_pnl: RwLock<HashMap<String, f64>>,
}

impl DrawdownMonitor {
    pub fn new(trader_name: impl Into<String>, exchange: Arc<dyn ExchangeTrader>) -> Self {
        Self {
            trader_name: trader_name.into(),
            exchange,
            peak_pnl: RwLock::new(HashMap::new()),
        }
    }

    /// 峰值缓存快照（API展示用）
    pub async fn peak_snapshot(&self) -> HashMap<String, f64> {
        self.peak_pnl.read().await.clone()
    }

    async fn update_peak(&self, symbol: &str, current: f64) -> f64 {
        let mut cache = self.peak_pnl.write().await;
        let entry = cache.entry(symbol.to_string()).or_insert(current);
        if current > *entry {
            *entry = current;
        }
        *entry
    }

    async fn clear_peak(&self, symbol: &str) {
        self.peak_pnl.write().await.remove(symbol);
    }

    /// 单次检查全部持仓
    pub async fn tick(&self) {
        let positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!("[{}] 回撤监控：获取持仓失败: {}", self.trader_name, e);
                return;
            }
        };

        for position in &positions {
            let current = leveraged_return_pct(position);

            // 先读旧峰值再更新：首次出现时峰值即当前值，回撤为0
            let peak = {
                let cache = self.peak_pnl.read().await;
                cache.get(&position.symbol).copied()
            };
            let peak = match peak {
                Some(p) => {
                    self.update_peak(&position.symbol, current).await;
                    p
                }
                None => self.update_peak(&position.symbol, current).await,
            };

            let dd = drawdown_pct(peak, current);
            if should_emergency_close(current, peak) {
                warn!(
                    "[{}] 触发回撤平仓: {} {} | 当前收益: {:.2}% | 峰值: {:.2}% | 回撤: {:.2}%",
                    self.trader_name, position.symbol, position.side, current, peak, dd
                );
                match self.exchange.close(&position.symbol, position.side, 0.0).await {
                    Ok(result) => {
                        info!(
                            "[{}] 回撤平仓成功: {} {} 订单ID: {}",
                            self.trader_name, position.symbol, position.side, result.order_id
                        );
                        self.clear_peak(&position.symbol).await;
                    }
                    Err(e) => {
                        error!(
                            "[{}] 回撤平仓失败 ({} {}): {}",
                            self.trader_name, position.symbol, position.side, e
                        );
                    }
                }
            } else if current > MIN_PROFIT_PCT {
                debug!(
                    "[{}] 回撤监控: {} {} | 收益: {:.2}% | 峰值: {:.2}% | 回撤: {:.2}%",
                    self.trader_name, position.symbol, position.side, current, peak, dd
                );
            }
        }
    }

    /// 监控主循环，收到停止信号后退出
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!("[{}] 启动持仓回撤监控（每分钟检查一次）", self.trader_name);
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // 第一次tick立即返回，跳过它让首检发生在一个周期之后
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    self.tick().await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[{}] 停止持仓回撤监控", self.trader_name);
    }
}
