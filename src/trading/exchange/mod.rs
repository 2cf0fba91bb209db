//! 交易所适配层
//!
//! ExchangeTrader是对单个永续合约平台的统一能力抽象，屏蔽交易对格式、
//! 签名认证与精度取整。引擎、执行层与回撤监控共享同一个适配器实例，
//! 适配器内部负责并发一致性。

pub mod cache;
pub mod okx;

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// 持仓方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    pub fn opposite(self) -> Self {
        match self {
            PosSide::Long => PosSide::Short,
            PosSide::Short => PosSide::Long,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Some(PosSide::Long),
            "short" => Some(PosSide::Short),
            _ => None,
        }
    }
}

impl Display for PosSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PosSide::Long => write!(f, "long"),
            PosSide::Short => write!(f, "short"),
        }
    }
}

/// 账户余额快照（USDT计价）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    /// 钱包余额（不含未实现盈亏）
    pub total_wallet: f64,
    /// 账户净值（美金层面权益）
    pub total_equity: f64,
    /// 可用余额
    pub available: f64,
    /// 未实现盈亏
    pub unrealized_pnl: f64,
    /// 保证金率（小数形式，0.5表示50%）
    pub margin_ratio: f64,
}

/// 持仓快照
///
/// 数量恒为正数，方向由side表达；quantity为0的"幽灵持仓"在适配器内剔除，
/// 不会出现在任何上层视图中。first_seen_ms由引擎维护，不信任交易所的开仓时间。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PosSide,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    /// 以保证金为基数的收益率（百分比）
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
    /// 引擎首次观察到该持仓的时间（毫秒），由周期任务填写
    #[serde(default)]
    pub first_seen_ms: i64,
}

/// 下单/平仓结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    /// 实际提交的数量（精度取整后）
    pub quantity: f64,
    /// 参考成交价（下单时的标记价格）
    pub price: f64,
}

/// 交易所统一能力接口
///
/// get_balance/get_positions允许返回不超过10秒的缓存；任何一次成功的
/// 变更操作之后两份缓存都必须失效，读方只会看到变更前或变更后的完整快照。
#[async_trait]
pub trait ExchangeTrader: Send + Sync {
    /// 平台标识
    fn venue(&self) -> &str;

    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    /// 全部非零持仓
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// 设置仓位模式；"已是目标模式"视为成功
    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), ExchangeError>;

    /// 设置杠杆；side为None时同时设置多空两个方向；"无需变更"视为成功
    async fn set_leverage(
        &self,
        symbol: &str,
        side: Option<PosSide>,
        leverage: u32,
    ) -> Result<(), ExchangeError>;

    /// 市价开仓，附带止盈止损。适配器负责：重复持仓拒绝、lot取整、
    /// 取整后保证金校验、止盈止损与标记价/预估爆仓价的合理性校验。
    async fn open(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        leverage: u32,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderResult, ExchangeError>;

    /// 市价平仓；quantity为0表示全部平仓
    async fn close(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError>;

    /// 仅取消止损单，返回取消数量
    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<usize, ExchangeError>;

    /// 仅取消止盈单，返回取消数量
    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<usize, ExchangeError>;

    /// 取消该币种所有挂单，返回取消数量
    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize, ExchangeError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError>;

    /// 最新标记价格
    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// 数量精度（小数位数）
    async fn get_symbol_precision(&self, symbol: &str) -> Result<u32, ExchangeError>;

    /// 最小数量增量
    async fn get_lot_size(&self, symbol: &str) -> Result<f64, ExchangeError>;
}

/// 根据lot size向上取整数量。数量低于一个lot时取整到一个lot。
pub fn round_up_to_lot(quantity: f64, lot_size: f64) -> f64 {
    if quantity <= 0.0 || lot_size <= 0.0 {
        return quantity;
    }
    if quantity < lot_size {
        lot_size
    } else {
        (quantity / lot_size).ceil() * lot_size
    }
}
