//! 集成测试共用的fake实现：交易所、AI网关、市场数据源与配置存储

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use ai_quant::error::{AppError, ExchangeError};
use ai_quant::trading::ai::LlmApi;
use ai_quant::trading::config::{
    BalanceSyncBasis, ConfigStore, ExchangeProfile, LlmProfile, LlmProvider, PromptTemplate,
    TraderConfig,
};
use ai_quant::trading::exchange::{
    round_up_to_lot, Balance, ExchangeTrader, OrderResult, PosSide, Position,
};
use ai_quant::trading::market::{MarketDataSource, MarketSnapshot};

/// 测试用交易员配置
pub fn test_config(id: &str) -> TraderConfig {
    TraderConfig {
        id: id.to_string(),
        name: format!("trader-{}", id),
        llm: LlmProfile {
            provider: LlmProvider::ChatCompletions,
            api_key: "sk-test".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            assistant_id: None,
            thread_id: None,
        },
        exchange: ExchangeProfile {
            venue: "mock".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            passphrase: String::new(),
            testnet: true,
            is_cross_margin: false,
        },
        scan_interval_secs: 180,
        initial_balance: 100.0,
        btc_eth_leverage: 10,
        altcoin_leverage: 5,
        trading_coins: vec![],
        use_coin_pool: true,
        use_oi_top: true,
        prompt_template: "default".to_string(),
        custom_prompt: None,
        override_base_prompt: false,
        max_daily_loss_pct: None,
        max_drawdown_pct: None,
        stop_trading_secs: None,
        balance_sync_basis: BalanceSyncBasis::Available,
    }
}

pub fn position(symbol: &str, side: PosSide, quantity: f64, entry: f64, leverage: u32) -> Position {
    let margin = quantity * entry / leverage.max(1) as f64;
    Position {
        symbol: symbol.to_string(),
        side,
        entry_price: entry,
        mark_price: entry,
        quantity,
        leverage,
        unrealized_pnl: 0.0,
        unrealized_pnl_pct: 0.0,
        liquidation_price: match side {
            PosSide::Long => entry * (1.0 - 1.0 / leverage.max(1) as f64),
            PosSide::Short => entry * (1.0 + 1.0 / leverage.max(1) as f64),
        },
        margin_used: margin,
        first_seen_ms: 0,
    }
}

/// 内存交易所：实现完整的适配器契约（幽灵仓剔除、重复开仓拒绝、
/// lot取整、保证金校验），并记录全部操作供断言。
pub struct MockExchange {
    pub balance: Mutex<Balance>,
    pub positions: Mutex<Vec<Position>>,
    pub mark_prices: Mutex<HashMap<String, f64>>,
    pub lot_sizes: Mutex<HashMap<String, f64>>,
    /// 操作日志，形如 "open BTCUSDT long" / "close BTCUSDT long"
    pub calls: Mutex<Vec<String>>,
    next_order_id: AtomicU64,
}

impl MockExchange {
    pub fn new(available: f64) -> Self {
        Self {
            balance: Mutex::new(Balance {
                total_wallet: available,
                total_equity: available,
                available,
                unrealized_pnl: 0.0,
                margin_ratio: 0.0,
            }),
            positions: Mutex::new(Vec::new()),
            mark_prices: Mutex::new(HashMap::new()),
            lot_sizes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub async fn set_mark_price(&self, symbol: &str, price: f64) {
        self.mark_prices
            .lock()
            .await
            .insert(symbol.to_string(), price);
        for pos in self.positions.lock().await.iter_mut() {
            if pos.symbol == symbol {
                pos.mark_price = price;
            }
        }
    }

    pub async fn add_position(&self, pos: Position) {
        self.positions.lock().await.push(pos);
    }

    pub async fn call_log(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// 日志中变更类操作的序列（open/close/set_sl/set_tp/cancel）
    pub async fn mutation_log(&self) -> Vec<String> {
        self.call_log()
            .await
            .into_iter()
            .filter(|c| {
                c.starts_with("open")
                    || c.starts_with("close")
                    || c.starts_with("set_stop_loss")
                    || c.starts_with("set_take_profit")
                    || c.starts_with("cancel")
            })
            .collect()
    }

    fn order_id(&self) -> String {
        format!("mock-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn log(&self, entry: String) {
        self.calls.lock().await.push(entry);
    }
}

#[async_trait]
impl ExchangeTrader for MockExchange {
    fn venue(&self) -> &str {
        "mock"
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        self.log("get_balance".to_string()).await;
        Ok(self.balance.lock().await.clone())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.log("get_positions".to_string()).await;
        Ok(self
            .positions
            .lock()
            .await
            .iter()
            .filter(|p| p.quantity != 0.0)
            .cloned()
            .collect())
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), ExchangeError> {
        self.log(format!("set_margin_mode {} {}", symbol, is_cross))
            .await;
        Ok(())
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        side: Option<PosSide>,
        leverage: u32,
    ) -> Result<(), ExchangeError> {
        self.log(format!("set_leverage {} {:?} {}", symbol, side, leverage))
            .await;
        Ok(())
    }

    async fn open(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        leverage: u32,
        _stop_loss: Option<f64>,
        _take_profit: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        // 同币种同方向重复开仓拒绝
        if self
            .positions
            .lock()
            .await
            .iter()
            .any(|p| p.symbol == symbol && p.side == side && p.quantity > 0.0)
        {
            return Err(ExchangeError::AlreadyOpen {
                symbol: symbol.to_string(),
                side: side.to_string(),
            });
        }

        let mark = self
            .mark_prices
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(100.0);
        let lot = self
            .lot_sizes
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(0.0001);
        let rounded = round_up_to_lot(quantity, lot);

        let margin = rounded * mark / leverage.max(1) as f64;
        {
            let mut balance = self.balance.lock().await;
            if margin > balance.available {
                return Err(ExchangeError::InsufficientMargin {
                    required: margin,
                    available: balance.available,
                    min_qty: lot,
                });
            }
            balance.available -= margin;
        }

        let mut pos = position(symbol, side, rounded, mark, leverage);
        pos.margin_used = margin;
        self.positions.lock().await.push(pos);
        self.log(format!("open {} {}", symbol, side)).await;
        Ok(OrderResult {
            order_id: self.order_id(),
            symbol: symbol.to_string(),
            quantity: rounded,
            price: mark,
        })
    }

    async fn close(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let mut positions = self.positions.lock().await;
        let Some(idx) = positions
            .iter()
            .position(|p| p.symbol == symbol && p.side == side && p.quantity > 0.0)
        else {
            return Err(ExchangeError::NoSuchPosition(format!(
                "没有找到 {} 的{}仓",
                symbol, side
            )));
        };

        let full = positions[idx].quantity;
        let close_qty = if quantity == 0.0 {
            full
        } else {
            quantity.min(full)
        };
        let released = positions[idx].margin_used * close_qty / full;
        if close_qty >= full {
            positions.remove(idx);
        } else {
            positions[idx].quantity -= close_qty;
            positions[idx].margin_used -= released;
        }
        drop(positions);

        self.balance.lock().await.available += released;
        self.log(format!("close {} {}", symbol, side)).await;
        Ok(OrderResult {
            order_id: self.order_id(),
            symbol: symbol.to_string(),
            quantity: close_qty,
            price: self
                .mark_prices
                .lock()
                .await
                .get(symbol)
                .copied()
                .unwrap_or(100.0),
        })
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.log(format!("cancel_stop_loss {}", symbol)).await;
        Ok(0)
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.log(format!("cancel_take_profit {}", symbol)).await;
        Ok(0)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.log(format!("cancel_all {}", symbol)).await;
        Ok(0)
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PosSide,
        _quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError> {
        self.log(format!("set_stop_loss {} {} {}", symbol, side, price))
            .await;
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PosSide,
        _quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError> {
        self.log(format!("set_take_profit {} {} {}", symbol, side, price))
            .await;
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self
            .mark_prices
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(100.0))
    }

    async fn get_symbol_precision(&self, _symbol: &str) -> Result<u32, ExchangeError> {
        Ok(4)
    }

    async fn get_lot_size(&self, symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self
            .lot_sizes
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(0.0001))
    }
}

/// 脚本化的AI：按顺序吐出预置响应，耗尽后返回wait
pub struct FakeLlm {
    responses: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmApi for FakeLlm {
    async fn call_with_messages(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AppError> {
        self.calls
            .lock()
            .await
            .push((system_prompt.to_string(), user_prompt.to_string()));
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            Ok(r#"[{"symbol":"ALL","action":"wait","reasoning":"默认观望"}]"#.to_string())
        } else {
            Ok(responses.remove(0))
        }
    }
}

/// 调用即失败的AI（测试周期级错误路径）
pub struct FailingLlm;

#[async_trait]
impl LlmApi for FailingLlm {
    async fn call_with_messages(&self, _s: &str, _u: &str) -> Result<String, AppError> {
        Err(AppError::LlmError("API返回错误 (status 401): bad key".to_string()))
    }
}

/// 合成快照的市场数据源，记录拉取次数
pub struct FakeMarket {
    pub prices: Mutex<HashMap<String, f64>>,
    pub snapshot_count: AtomicU64,
    /// 指定失败的symbol
    pub failing: Mutex<Vec<String>>,
}

impl FakeMarket {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            snapshot_count: AtomicU64::new(0),
            failing: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().await.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl MarketDataSource for FakeMarket {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        self.snapshot_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().await.iter().any(|s| s == symbol) {
            return Err(ExchangeError::Transport(format!("{} 行情不可用", symbol)));
        }
        let price = self
            .prices
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(100.0);
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            current_price: price,
            current_ema20: price,
            current_rsi7: 50.0,
            ..MarketSnapshot::default()
        })
    }
}

/// 配置存储fake：内置default模板并记录余额回写
pub struct FakeStore {
    pub templates: Mutex<HashMap<String, String>>,
    pub balance_updates: Mutex<Vec<(String, f64)>>,
}

impl FakeStore {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            "default".to_string(),
            "你是专业的加密货币交易AI。".to_string(),
        );
        Self {
            templates: Mutex::new(templates),
            balance_updates: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ConfigStore for FakeStore {
    async fn prompt_template(&self, name: &str) -> Option<PromptTemplate> {
        self.templates
            .lock()
            .await
            .get(name)
            .map(|content| PromptTemplate {
                name: name.to_string(),
                content: content.clone(),
            })
    }

    async fn update_initial_balance(
        &self,
        trader_id: &str,
        new_balance: f64,
    ) -> Result<(), AppError> {
        self.balance_updates
            .lock()
            .await
            .push((trader_id.to_string(), new_balance));
        Ok(())
    }
}

/// 一套默认接线的测试环境
pub struct TestRig {
    pub exchange: Arc<MockExchange>,
    pub market: Arc<FakeMarket>,
    pub store: Arc<FakeStore>,
    pub tmp: tempfile::TempDir,
}

impl TestRig {
    pub fn new(available: f64) -> Self {
        Self {
            exchange: Arc::new(MockExchange::new(available)),
            market: Arc::new(FakeMarket::new()),
            store: Arc::new(FakeStore::new()),
            tmp: tempfile::tempdir().expect("创建临时目录失败"),
        }
    }
}
