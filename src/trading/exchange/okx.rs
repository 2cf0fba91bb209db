//! OKX永续合约交易适配器
//!
//! 实现ExchangeTrader统一接口：HMAC-SHA256签名、请求重试、余额/持仓
//! 读穿缓存（10秒TTL，任何成功变更后立即失效）、lot精度取整与下单前
//! 止盈止损合理性校验。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::ExchangeError;
use crate::trading::exchange::cache::TtlCache;
use crate::trading::exchange::{
    round_up_to_lot, Balance, ExchangeTrader, OrderResult, PosSide, Position,
};

/// 缓存有效期
const CACHE_TTL: Duration = Duration::from_secs(10);
/// 传输层重试次数
const MAX_TRANSPORT_RETRIES: u32 = 3;
/// 切换杠杆后的冷却等待
const LEVERAGE_COOLDOWN: Duration = Duration::from_secs(5);

pub struct OkxTrader {
    api_key: String,
    secret_key: String,
    passphrase: String,
    base_url: String,
    testnet: bool,
    is_cross_margin: bool,
    client: Client,

    balance_cache: TtlCache<Balance>,
    positions_cache: TtlCache<Vec<Position>>,

    /// 交易对数量精度缓存（小数位数）
    precision_cache: RwLock<HashMap<String, u32>>,
    /// 交易对lotSz缓存（最小数量单位）
    lot_size_cache: RwLock<HashMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct OkxApiResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceData {
    #[serde(default)]
    details: Vec<BalanceDetail>,
    #[serde(default)]
    total_eq: String,
    #[serde(default)]
    adj_eq: String,
    #[serde(default)]
    mgn_ratio: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    #[serde(default)]
    avail_eq: String,
    #[serde(default)]
    upl: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionData {
    inst_id: String,
    #[serde(default)]
    pos: String,
    #[serde(default)]
    avg_px: String,
    #[serde(default)]
    mark_px: String,
    #[serde(default)]
    upl: String,
    #[serde(default)]
    lever: String,
    #[serde(default)]
    liq_px: String,
    #[serde(default)]
    pos_side: String,
    #[serde(default)]
    margin: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachAlgoOrd {
    attach_algo_cl_ord_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sl_trigger_px: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sl_trigger_px_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sl_ord_px: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tp_trigger_px: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tp_trigger_px_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tp_ord_px: Option<String>,
    sz: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest {
    inst_id: String,
    td_mode: String,
    side: String,
    ord_type: String,
    sz: String,
    pos_side: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reduce_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attach_algo_ords: Option<Vec<AttachAlgoOrd>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponseData {
    #[serde(default)]
    ord_id: String,
    #[serde(default)]
    s_code: String,
    #[serde(default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrderData {
    ord_id: String,
    #[serde(default)]
    ord_type: String,
    #[serde(default)]
    pos_side: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentData {
    #[serde(default)]
    lot_sz: String,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(default)]
    last: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse::<f64>().unwrap_or(0.0)
}

/// 从lotSz字符串计算小数精度（"0.001" -> 3）
fn precision_from_lot_sz(lot_sz: &str) -> u32 {
    let trimmed = lot_sz.trim_end_matches('0').trim_end_matches('.');
    match trimmed.find('.') {
        Some(idx) => (trimmed.len() - idx - 1) as u32,
        None => 0,
    }
}

impl OkxTrader {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        passphrase: impl Into<String>,
        testnet: bool,
        is_cross_margin: bool,
    ) -> Self {
        let trader = Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            passphrase: passphrase.into(),
            // OKX测试网使用相同域名，通过模拟盘请求头区分
            base_url: "https://www.okx.com".to_string(),
            testnet,
            is_cross_margin,
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("构建HTTP客户端失败"),
            balance_cache: TtlCache::new(CACHE_TTL),
            positions_cache: TtlCache::new(CACHE_TTL),
            precision_cache: RwLock::new(HashMap::new()),
            lot_size_cache: RwLock::new(HashMap::new()),
        };
        info!("OKX交易器初始化成功 (testnet={})", testnet);
        trader
    }

    fn td_mode(&self) -> &'static str {
        if self.is_cross_margin {
            "cross"
        } else {
            "isolated"
        }
    }

    /// 交易对格式转换 BTCUSDT -> BTC-USDT-SWAP
    fn to_inst_id(symbol: &str) -> String {
        let base = symbol.trim_end_matches("USDT");
        format!("{}-USDT-SWAP", base)
    }

    /// 交易对格式转换 BTC-USDT-SWAP -> BTCUSDT
    fn from_inst_id(inst_id: &str) -> String {
        inst_id.replace("-USDT-SWAP", "USDT").replace('-', "")
    }

    fn sign(&self, timestamp: &str, method: &Method, path: &str, body: &str) -> Result<String, ExchangeError> {
        let payload = format!("{}{}{}{}", timestamp, method.as_str(), path, body);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Transport(format!("签名初始化失败: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// 发送签名请求并解包OKX响应。传输层错误与5xx重试，4xx与业务错误码不重试。
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let body_str = match body {
            Some(v) => serde_json::to_string(v)
                .map_err(|e| ExchangeError::Transport(format!("序列化请求体失败: {}", e)))?,
            None => String::new(),
        };

        let mut last_err = ExchangeError::Transport("未发送请求".to_string());
        for attempt in 1..=MAX_TRANSPORT_RETRIES {
            let timestamp = chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string();
            let signature = self.sign(&timestamp, &method, path, &body_str)?;

            let mut builder = self
                .client
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
                .header("Content-Type", "application/json");
            if self.testnet {
                builder = builder.header("x-simulated-trading", "1");
            }
            if !body_str.is_empty() {
                builder = builder.body(body_str.clone());
            }

            let resp = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = ExchangeError::Transport(format!("请求失败: {}", e));
                    if attempt < MAX_TRANSPORT_RETRIES {
                        let wait = Duration::from_secs(2 * attempt as u64);
                        warn!(
                            "OKX API请求失败（尝试 {}/{}），{:?}后重试: {}",
                            attempt, MAX_TRANSPORT_RETRIES, wait, e
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(last_err);
                }
            };

            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| ExchangeError::Transport(format!("读取响应失败: {}", e)))?;

            if status != StatusCode::OK {
                last_err = ExchangeError::Api {
                    code: status.as_u16().to_string(),
                    msg: text.clone(),
                };
                // 5xx可以重试，4xx直接失败
                if status.is_server_error() && attempt < MAX_TRANSPORT_RETRIES {
                    let wait = Duration::from_secs(2 * attempt as u64);
                    warn!(
                        "OKX API服务器错误（尝试 {}/{}），{:?}后重试: {}",
                        attempt, MAX_TRANSPORT_RETRIES, wait, status
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return Err(last_err);
            }

            let parsed: OkxApiResponse = serde_json::from_str(&text)
                .map_err(|e| ExchangeError::Transport(format!("解析响应失败: {}", e)))?;
            if parsed.code != "0" {
                error!(
                    "OKX API错误: code={}, msg={}, path={} {}",
                    parsed.code, parsed.msg, method, path
                );
                return Err(ExchangeError::Api {
                    code: parsed.code,
                    msg: parsed.msg,
                });
            }
            return Ok(parsed.data);
        }

        Err(last_err)
    }

    /// 任何成功的变更操作之后调用：同时废弃余额与持仓缓存
    async fn invalidate_caches(&self) {
        self.balance_cache.invalidate().await;
        self.positions_cache.invalidate().await;
    }

    async fn fetch_balance_uncached(&self) -> Result<Balance, ExchangeError> {
        let data = self
            .request(Method::GET, "/api/v5/account/balance", None)
            .await?;
        let list: Vec<BalanceData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Transport(format!("解析余额数据失败: {}", e)))?;
        let Some(raw) = list.into_iter().next() else {
            return Err(ExchangeError::Api {
                code: "empty".to_string(),
                msg: "未找到余额信息".to_string(),
            });
        };

        let mut balance = Balance {
            total_wallet: parse_f64(&raw.total_eq),
            total_equity: parse_f64(&raw.adj_eq),
            margin_ratio: parse_f64(&raw.mgn_ratio),
            ..Balance::default()
        };
        for detail in &raw.details {
            if detail.ccy == "USDT" {
                balance.available = parse_f64(&detail.avail_eq);
                balance.unrealized_pnl = parse_f64(&detail.upl);
                break;
            }
        }
        if balance.total_equity <= 0.0 {
            balance.total_equity = balance.total_wallet + balance.unrealized_pnl;
        }
        debug!(
            "OKX余额: 净值={:.2}, 可用={:.2}, 保证金率={:.4}",
            balance.total_equity, balance.available, balance.margin_ratio
        );
        Ok(balance)
    }

    async fn fetch_positions_uncached(&self) -> Result<Vec<Position>, ExchangeError> {
        let data = self
            .request(Method::GET, "/api/v5/account/positions", None)
            .await?;
        let list: Vec<PositionData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Transport(format!("解析持仓数据失败: {}", e)))?;

        let mut result = Vec::new();
        for raw in list {
            let pos_amt = parse_f64(&raw.pos);
            // 剔除幽灵持仓
            if pos_amt == 0.0 {
                continue;
            }

            let side = match PosSide::parse(&raw.pos_side) {
                Some(s) => s,
                None => {
                    // 兼容处理：posSide为空时按数量符号判断
                    let inferred = if pos_amt > 0.0 {
                        PosSide::Long
                    } else {
                        PosSide::Short
                    };
                    warn!(
                        "OKX持仓方向未知(posSide={})，使用数量判断: {}",
                        raw.pos_side, inferred
                    );
                    inferred
                }
            };

            let quantity = pos_amt.abs();
            let mark_price = parse_f64(&raw.mark_px);
            let leverage = parse_f64(&raw.lever).max(1.0) as u32;
            let unrealized_pnl = parse_f64(&raw.upl);
            let mut margin_used = parse_f64(&raw.margin);
            if margin_used <= 0.0 {
                // 回退计算：保证金 = 名义价值 / 杠杆
                margin_used = quantity * mark_price / leverage as f64;
            }
            let unrealized_pnl_pct = if margin_used > 0.0 {
                unrealized_pnl / margin_used * 100.0
            } else {
                0.0
            };

            result.push(Position {
                symbol: Self::from_inst_id(&raw.inst_id),
                side,
                entry_price: parse_f64(&raw.avg_px),
                mark_price,
                quantity,
                leverage,
                unrealized_pnl,
                unrealized_pnl_pct,
                liquidation_price: parse_f64(&raw.liq_px),
                margin_used,
                first_seen_ms: 0,
            });
        }
        Ok(result)
    }

    /// 取消指定订单类型的挂单，返回取消数量
    async fn cancel_orders_by_type(
        &self,
        symbol: &str,
        ord_types: &[&str],
    ) -> Result<usize, ExchangeError> {
        let inst_id = Self::to_inst_id(symbol);
        let data = self
            .request(
                Method::GET,
                &format!("/api/v5/trade/orders-pending?instId={}", inst_id),
                None,
            )
            .await?;
        let orders: Vec<PendingOrderData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Transport(format!("解析订单列表失败: {}", e)))?;

        let mut cancelled = 0usize;
        for order in orders {
            if !ord_types.is_empty() && !ord_types.contains(&order.ord_type.as_str()) {
                continue;
            }
            let body = serde_json::json!({
                "instId": inst_id,
                "ordId": order.ord_id,
            });
            match self
                .request(Method::POST, "/api/v5/trade/cancel-order", Some(&body))
                .await
            {
                Ok(_) => {
                    cancelled += 1;
                    debug!(
                        "已取消挂单 (订单ID: {}, 类型: {}, 方向: {})",
                        order.ord_id, order.ord_type, order.pos_side
                    );
                }
                Err(e) => warn!("取消订单 {} 失败: {}", order.ord_id, e),
            }
        }

        if cancelled > 0 {
            self.invalidate_caches().await;
            info!("已取消 {} 的 {} 个挂单", symbol, cancelled);
        }
        Ok(cancelled)
    }

    /// 下单前校验止盈止损与当前标记价、预估爆仓价的关系
    fn check_protective_prices(
        side: PosSide,
        mark: f64,
        leverage: u32,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), ExchangeError> {
        let lev = leverage.max(1) as f64;
        match side {
            PosSide::Long => {
                let liq_estimate = mark * (1.0 - 1.0 / lev);
                if let Some(sl) = stop_loss {
                    if sl >= mark {
                        return Err(ExchangeError::PrecisionReject(format!(
                            "做多止损价 ({:.4}) 必须低于当前价 ({:.4})",
                            sl, mark
                        )));
                    }
                    if sl <= liq_estimate {
                        return Err(ExchangeError::PrecisionReject(format!(
                            "止损价 ({:.4}) 必须高于预估爆仓价 ({:.4})，否则止损失效",
                            sl, liq_estimate
                        )));
                    }
                }
                if let Some(tp) = take_profit {
                    if tp <= mark {
                        return Err(ExchangeError::PrecisionReject(format!(
                            "做多止盈价 ({:.4}) 必须高于当前价 ({:.4})",
                            tp, mark
                        )));
                    }
                    if let Some(sl) = stop_loss {
                        if sl >= tp {
                            return Err(ExchangeError::PrecisionReject(format!(
                                "做多止损 ({:.4}) 必须低于止盈 ({:.4})",
                                sl, tp
                            )));
                        }
                    }
                }
            }
            PosSide::Short => {
                let liq_estimate = mark * (1.0 + 1.0 / lev);
                if let Some(sl) = stop_loss {
                    if sl <= mark {
                        return Err(ExchangeError::PrecisionReject(format!(
                            "做空止损价 ({:.4}) 必须高于当前价 ({:.4})",
                            sl, mark
                        )));
                    }
                    if sl >= liq_estimate {
                        return Err(ExchangeError::PrecisionReject(format!(
                            "止损价 ({:.4}) 必须低于预估爆仓价 ({:.4})，否则止损失效",
                            sl, liq_estimate
                        )));
                    }
                }
                if let Some(tp) = take_profit {
                    if tp >= mark {
                        return Err(ExchangeError::PrecisionReject(format!(
                            "做空止盈价 ({:.4}) 必须低于当前价 ({:.4})",
                            tp, mark
                        )));
                    }
                    if let Some(sl) = stop_loss {
                        if sl <= tp {
                            return Err(ExchangeError::PrecisionReject(format!(
                                "做空止损 ({:.4}) 必须高于止盈 ({:.4})",
                                sl, tp
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn format_quantity(quantity: f64, precision: u32) -> String {
        format!("{:.*}", precision as usize, quantity)
    }

    /// 解析下单响应，sCode非0折算为Api错误
    fn parse_order_response(
        data: serde_json::Value,
        context: &str,
    ) -> Result<OrderResponseData, ExchangeError> {
        let list: Vec<OrderResponseData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Transport(format!("解析订单响应失败: {}", e)))?;
        let Some(order) = list.into_iter().next() else {
            return Err(ExchangeError::Api {
                code: "empty".to_string(),
                msg: format!("{}: 订单响应为空", context),
            });
        };
        if order.s_code != "0" {
            error!("{}失败: 错误代码={}, 错误信息={}", context, order.s_code, order.s_msg);
            return Err(ExchangeError::Api {
                code: order.s_code,
                msg: order.s_msg,
            });
        }
        Ok(order)
    }
}

#[async_trait]
impl ExchangeTrader for OkxTrader {
    fn venue(&self) -> &str {
        "okx"
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        if let Some(balance) = self.balance_cache.get().await {
            if let Some(age) = self.balance_cache.age().await {
                debug!("使用缓存的账户余额（{:.1}秒前）", age.as_secs_f64());
            }
            return Ok(balance);
        }
        let balance = self.fetch_balance_uncached().await?;
        self.balance_cache.set(balance.clone()).await;
        Ok(balance)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        if let Some(positions) = self.positions_cache.get().await {
            return Ok(positions);
        }
        let positions = self.fetch_positions_uncached().await?;
        self.positions_cache.set(positions.clone()).await;
        Ok(positions)
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), ExchangeError> {
        let mode = if is_cross { "cross" } else { "isolated" };
        let body = serde_json::json!({
            "instId": Self::to_inst_id(symbol),
            "mgnMode": mode,
        });
        match self
            .request(Method::POST, "/api/v5/account/set-position-mode", Some(&body))
            .await
        {
            Ok(_) => {
                debug!("{} 仓位模式已设置为 {}", symbol, mode);
                Ok(())
            }
            Err(ExchangeError::Api { msg, .. }) if ExchangeError::is_already_satisfied(&msg) => {
                debug!("{} 仓位模式已是 {}", symbol, mode);
                Ok(())
            }
            Err(e) => {
                // 仓位模式设置失败不阻断交易
                warn!("设置仓位模式失败: {}", e);
                Ok(())
            }
        }
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        side: Option<PosSide>,
        leverage: u32,
    ) -> Result<(), ExchangeError> {
        let inst_id = Self::to_inst_id(symbol);
        let sides: Vec<PosSide> = match side {
            Some(s) => vec![s],
            None => vec![PosSide::Long, PosSide::Short],
        };

        let mut changed = false;
        for pos_side in sides {
            let body = serde_json::json!({
                "instId": inst_id,
                "lever": leverage.to_string(),
                "mgnMode": self.td_mode(),
                "posSide": pos_side.to_string(),
            });
            match self
                .request(Method::POST, "/api/v5/account/set-leverage", Some(&body))
                .await
            {
                Ok(_) => {
                    changed = true;
                    debug!("{} {} 杠杆已切换为 {}x", symbol, pos_side, leverage);
                }
                Err(ExchangeError::Api { msg, .. })
                    if ExchangeError::is_already_satisfied(&msg) =>
                {
                    debug!("{} {} 杠杆已是 {}x", symbol, pos_side, leverage);
                }
                Err(e) => return Err(e),
            }
        }

        if changed {
            // 切换杠杆后等待冷却期，避免后续下单被拒
            tokio::time::sleep(LEVERAGE_COOLDOWN).await;
        }
        Ok(())
    }

    async fn open(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        leverage: u32,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        // 重复持仓检查必须绕过缓存
        let positions = self.fetch_positions_uncached().await?;
        if positions
            .iter()
            .any(|p| p.symbol == symbol && p.side == side && p.quantity > 0.0)
        {
            return Err(ExchangeError::AlreadyOpen {
                symbol: symbol.to_string(),
                side: side.to_string(),
            });
        }

        let mark = self.get_mark_price(symbol).await?;
        let balance = self.get_balance().await?;

        // lot取整：恰好一个lot接受，不足一个lot取整到一个lot
        let lot_size = self.get_lot_size(symbol).await?;
        let precision = self.get_symbol_precision(symbol).await?;
        let rounded = round_up_to_lot(quantity, lot_size);
        if rounded > quantity * 1.1 {
            warn!(
                "{} 取整后数量 {:.8} 超过请求数量 {:.8} 的10%（仓位价值 {:.2} -> {:.2} USDT）",
                symbol,
                rounded,
                quantity,
                quantity * mark,
                rounded * mark
            );
        }

        // 取整后保证金校验
        let margin_required = rounded * mark / leverage.max(1) as f64;
        if margin_required > balance.available {
            return Err(ExchangeError::InsufficientMargin {
                required: margin_required,
                available: balance.available,
                min_qty: lot_size,
            });
        }

        Self::check_protective_prices(side, mark, leverage, stop_loss, take_profit)?;

        // 清掉该币种的历史挂单（杠杆与仓位模式由执行层在下单前设置）
        let _ = self.cancel_orders_by_type(symbol, &[]).await;

        let quantity_str = Self::format_quantity(rounded, precision);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut attach = Vec::new();
        if let Some(sl) = stop_loss {
            attach.push(AttachAlgoOrd {
                attach_algo_cl_ord_id: format!("sl{}", now_ms),
                sl_trigger_px: Some(format!("{:.8}", sl)),
                sl_trigger_px_type: Some("last".to_string()),
                // -1表示触发后按市价成交
                sl_ord_px: Some("-1".to_string()),
                tp_trigger_px: None,
                tp_trigger_px_type: None,
                tp_ord_px: None,
                sz: quantity_str.clone(),
            });
        }
        if let Some(tp) = take_profit {
            attach.push(AttachAlgoOrd {
                attach_algo_cl_ord_id: format!("tp{}", now_ms),
                sl_trigger_px: None,
                sl_trigger_px_type: None,
                sl_ord_px: None,
                tp_trigger_px: Some(format!("{:.8}", tp)),
                tp_trigger_px_type: Some("last".to_string()),
                tp_ord_px: Some("-1".to_string()),
                sz: quantity_str.clone(),
            });
        }

        let req = OrderRequest {
            inst_id: Self::to_inst_id(symbol),
            td_mode: self.td_mode().to_string(),
            side: match side {
                PosSide::Long => "buy".to_string(),
                PosSide::Short => "sell".to_string(),
            },
            ord_type: "market".to_string(),
            sz: quantity_str,
            pos_side: side.to_string(),
            reduce_only: None,
            attach_algo_ords: if attach.is_empty() { None } else { Some(attach) },
        };
        let body = serde_json::to_value(&req)
            .map_err(|e| ExchangeError::Transport(format!("序列化下单请求失败: {}", e)))?;
        debug!("开仓请求参数: {}", body);

        let data = self
            .request(Method::POST, "/api/v5/trade/order", Some(&body))
            .await?;
        let order = Self::parse_order_response(data, "开仓")?;

        self.invalidate_caches().await;
        info!(
            "开{}仓成功: {} 数量: {:.8} 订单ID: {}",
            side, symbol, rounded, order.ord_id
        );
        Ok(OrderResult {
            order_id: order.ord_id,
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
        // 数量为0表示全部平仓，从最新持仓解析
        let mut close_qty = quantity;
        if close_qty == 0.0 {
            let positions = self.fetch_positions_uncached().await?;
            close_qty = positions
                .iter()
                .find(|p| p.symbol == symbol && p.side == side)
                .map(|p| p.quantity)
                .unwrap_or(0.0);
            if close_qty == 0.0 {
                return Err(ExchangeError::NoSuchPosition(format!(
                    "没有找到 {} 的{}仓",
                    symbol, side
                )));
            }
        }

        let precision = self.get_symbol_precision(symbol).await?;
        let mark = self.get_mark_price(symbol).await.unwrap_or(0.0);
        let req = OrderRequest {
            inst_id: Self::to_inst_id(symbol),
            td_mode: self.td_mode().to_string(),
            side: match side {
                // 平多卖出，平空买入
                PosSide::Long => "sell".to_string(),
                PosSide::Short => "buy".to_string(),
            },
            ord_type: "market".to_string(),
            sz: Self::format_quantity(close_qty, precision),
            pos_side: side.to_string(),
            reduce_only: Some(true),
            attach_algo_ords: None,
        };
        let body = serde_json::to_value(&req)
            .map_err(|e| ExchangeError::Transport(format!("序列化平仓请求失败: {}", e)))?;

        let data = self
            .request(Method::POST, "/api/v5/trade/order", Some(&body))
            .await?;
        let order = Self::parse_order_response(data, "平仓")?;

        self.invalidate_caches().await;
        info!("平{}仓成功: {} 数量: {:.8}", side, symbol, close_qty);
        Ok(OrderResult {
            order_id: order.ord_id,
            symbol: symbol.to_string(),
            quantity: close_qty,
            price: mark,
        })
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.cancel_orders_by_type(symbol, &["stop_market", "stop", "conditional"])
            .await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.cancel_orders_by_type(symbol, &["take_profit_market", "take_profit"])
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.cancel_orders_by_type(symbol, &[]).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError> {
        let precision = self.get_symbol_precision(symbol).await?;
        let body = serde_json::json!({
            "instId": Self::to_inst_id(symbol),
            "tdMode": self.td_mode(),
            "side": match side { PosSide::Long => "sell", PosSide::Short => "buy" },
            "ordType": "conditional",
            "sz": Self::format_quantity(quantity, precision),
            "posSide": side.to_string(),
            "reduceOnly": true,
            "slTriggerPx": format!("{:.8}", price),
            "slTriggerPxType": "last",
            "slOrdPx": "-1",
        });
        let data = self
            .request(Method::POST, "/api/v5/trade/order-algo", Some(&body))
            .await?;
        Self::parse_order_response(data, "设置止损")?;
        self.invalidate_caches().await;
        info!("{} {} 止损已设置: {:.4}", symbol, side, price);
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PosSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), ExchangeError> {
        let precision = self.get_symbol_precision(symbol).await?;
        let body = serde_json::json!({
            "instId": Self::to_inst_id(symbol),
            "tdMode": self.td_mode(),
            "side": match side { PosSide::Long => "sell", PosSide::Short => "buy" },
            "ordType": "conditional",
            "sz": Self::format_quantity(quantity, precision),
            "posSide": side.to_string(),
            "reduceOnly": true,
            "tpTriggerPx": format!("{:.8}", price),
            "tpTriggerPxType": "last",
            "tpOrdPx": "-1",
        });
        let data = self
            .request(Method::POST, "/api/v5/trade/order-algo", Some(&body))
            .await?;
        Self::parse_order_response(data, "设置止盈")?;
        self.invalidate_caches().await;
        info!("{} {} 止盈已设置: {:.4}", symbol, side, price);
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let data = self
            .request(
                Method::GET,
                &format!("/api/v5/market/ticker?instId={}", Self::to_inst_id(symbol)),
                None,
            )
            .await?;
        let tickers: Vec<TickerData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Transport(format!("解析价格数据失败: {}", e)))?;
        let price = tickers
            .first()
            .map(|t| parse_f64(&t.last))
            .unwrap_or(0.0);
        if price <= 0.0 {
            return Err(ExchangeError::Api {
                code: "empty".to_string(),
                msg: format!("未找到 {} 的价格", symbol),
            });
        }
        Ok(price)
    }

    async fn get_symbol_precision(&self, symbol: &str) -> Result<u32, ExchangeError> {
        {
            let cache = self.precision_cache.read().await;
            if let Some(p) = cache.get(symbol) {
                return Ok(*p);
            }
        }
        let lot_sz = self.fetch_lot_sz_raw(symbol).await?;
        let precision = precision_from_lot_sz(&lot_sz);
        self.precision_cache
            .write()
            .await
            .insert(symbol.to_string(), precision);
        Ok(precision)
    }

    async fn get_lot_size(&self, symbol: &str) -> Result<f64, ExchangeError> {
        {
            let cache = self.lot_size_cache.read().await;
            if let Some(sz) = cache.get(symbol) {
                return Ok(*sz);
            }
        }
        let lot_sz_raw = self.fetch_lot_sz_raw(symbol).await?;
        let lot_sz = lot_sz_raw.parse::<f64>().unwrap_or(0.0001);
        self.lot_size_cache
            .write()
            .await
            .insert(symbol.to_string(), lot_sz);
        debug!("{} lotSz: {:.8}", symbol, lot_sz);
        Ok(lot_sz)
    }
}

impl OkxTrader {
    async fn fetch_lot_sz_raw(&self, symbol: &str) -> Result<String, ExchangeError> {
        let data = self
            .request(
                Method::GET,
                &format!(
                    "/api/v5/public/instruments?instType=SWAP&instId={}",
                    Self::to_inst_id(symbol)
                ),
                None,
            )
            .await?;
        let instruments: Vec<InstrumentData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Transport(format!("解析交易对信息失败: {}", e)))?;
        match instruments.first() {
            Some(inst) if !inst.lot_sz.is_empty() => Ok(inst.lot_sz.clone()),
            _ => {
                warn!("{} 未找到lotSz信息，使用默认值0.0001", symbol);
                Ok("0.0001".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversion() {
        assert_eq!(OkxTrader::to_inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(OkxTrader::from_inst_id("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(OkxTrader::from_inst_id("SOL-USDT-SWAP"), "SOLUSDT");
    }

    #[test]
    fn test_precision_from_lot_sz() {
        assert_eq!(precision_from_lot_sz("0.001"), 3);
        assert_eq!(precision_from_lot_sz("0.0100"), 2);
        assert_eq!(precision_from_lot_sz("1"), 0);
    }

    #[test]
    fn test_protective_price_checks_long() {
        // 合理：止损在爆仓价之上、现价之下；止盈在现价之上
        assert!(OkxTrader::check_protective_prices(
            PosSide::Long,
            100.0,
            10,
            Some(95.0),
            Some(110.0)
        )
        .is_ok());
        // 止损高于现价
        assert!(OkxTrader::check_protective_prices(
            PosSide::Long,
            100.0,
            10,
            Some(101.0),
            None
        )
        .is_err());
        // 止损低于预估爆仓价 100*(1-1/10)=90
        assert!(OkxTrader::check_protective_prices(
            PosSide::Long,
            100.0,
            10,
            Some(89.0),
            None
        )
        .is_err());
        // 止损高于止盈
        assert!(OkxTrader::check_protective_prices(
            PosSide::Long,
            100.0,
            10,
            Some(99.0),
            Some(98.0)
        )
        .is_err());
    }

    #[test]
    fn test_protective_price_checks_short() {
        assert!(OkxTrader::check_protective_prices(
            PosSide::Short,
            100.0,
            10,
            Some(105.0),
            Some(90.0)
        )
        .is_ok());
        // 做空止损必须高于现价
        assert!(OkxTrader::check_protective_prices(
            PosSide::Short,
            100.0,
            10,
            Some(99.0),
            None
        )
        .is_err());
        // 止损高于预估爆仓价 100*(1+1/10)=110
        assert!(OkxTrader::check_protective_prices(
            PosSide::Short,
            100.0,
            10,
            Some(111.0),
            None
        )
        .is_err());
    }
}
