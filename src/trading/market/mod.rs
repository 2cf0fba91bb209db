//! 市场数据模块
//!
//! 按需拉取指定币种的K线并计算全套技术指标，产出一次性的市场快照。
//! 快照是值对象，构建后不再变更，也不做缓存——每次调用对其时间戳负责。

pub mod indicator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ExchangeError;
use crate::trading::config::normalize_symbol;

/// 默认K线条数（覆盖最长周期指标的计算窗口）
pub const DEFAULT_KLINE_LIMIT: usize = 300;
/// 日内序列保留的数据点数
const INTRADAY_POINTS: usize = 20;

/// K线（旧在前）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 持仓量数据
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OiData {
    pub latest: f64,
    pub average: f64,
}

/// 布林带
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// KDJ指标
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Kdj {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

/// 多周期SMA
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SmaSet {
    pub sma5: f64,
    pub sma10: f64,
    pub sma20: f64,
    pub sma50: f64,
    pub sma100: f64,
}

/// 成交量均线
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolumeMa {
    pub ma5: f64,
    pub ma20: f64,
    pub ma50: f64,
}

/// 日内指标序列（3分钟K线，最近20个点）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntradaySeries {
    pub mid_prices: Vec<f64>,
    pub ema20: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
    pub obv: Vec<f64>,
}

/// 长周期上下文（4小时K线）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongerTermBundle {
    pub ema20: f64,
    pub ema50: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub current_volume: f64,
    pub average_volume: f64,
}

/// 市场快照（不可变值对象）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    /// 1小时价格变化百分比
    pub price_change_1h: f64,
    /// 4小时价格变化百分比
    pub price_change_4h: f64,
    pub current_ema20: f64,
    pub current_macd: f64,
    pub current_rsi7: f64,
    pub bollinger: BollingerBands,
    pub kdj: Kdj,
    pub sma: SmaSet,
    pub obv: f64,
    pub volume_ma: VolumeMa,
    pub intraday: IntradaySeries,
    pub longer_term: LongerTermBundle,
    pub open_interest: OiData,
    pub funding_rate: f64,
}

/// 市场数据源接口，按币种产出市场快照
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError>;
}

/// 基于K线序列构建完整快照；ticker_price不可用时回退到最后收盘价
pub fn build_snapshot(
    symbol: &str,
    klines_3m: &[Kline],
    klines_4h: &[Kline],
    ticker_price: Option<f64>,
    open_interest: OiData,
    funding_rate: f64,
) -> MarketSnapshot {
    let last_close = klines_3m.last().map(|k| k.close).unwrap_or(0.0);
    let current_price = ticker_price.filter(|p| *p > 0.0).unwrap_or(last_close);

    // 1小时 = 20根3分钟K线前
    let price_change_1h = if klines_3m.len() >= 21 {
        let ago = klines_3m[klines_3m.len() - 21].close;
        if ago > 0.0 {
            (current_price - ago) / ago * 100.0
        } else {
            0.0
        }
    } else {
        0.0
    };
    let price_change_4h = if klines_4h.len() >= 2 {
        let ago = klines_4h[klines_4h.len() - 2].close;
        if ago > 0.0 {
            (current_price - ago) / ago * 100.0
        } else {
            0.0
        }
    } else {
        0.0
    };

    let (upper, middle, lower) = indicator::bollinger_bands(klines_3m, 20, 2.0);
    let (k, d, j) = indicator::kdj(klines_3m, 9);

    MarketSnapshot {
        symbol: normalize_symbol(symbol),
        current_price,
        price_change_1h,
        price_change_4h,
        current_ema20: indicator::ema(klines_3m, 20),
        current_macd: indicator::macd(klines_3m),
        current_rsi7: indicator::rsi(klines_3m, 7),
        bollinger: BollingerBands {
            upper,
            middle,
            lower,
        },
        kdj: Kdj { k, d, j },
        sma: SmaSet {
            sma5: indicator::sma(klines_3m, 5),
            sma10: indicator::sma(klines_3m, 10),
            sma20: indicator::sma(klines_3m, 20),
            sma50: indicator::sma(klines_3m, 50),
            sma100: indicator::sma(klines_3m, 100),
        },
        obv: indicator::obv(klines_3m),
        volume_ma: VolumeMa {
            ma5: indicator::volume_ma(klines_3m, 5),
            ma20: indicator::volume_ma(klines_3m, 20),
            ma50: indicator::volume_ma(klines_3m, 50),
        },
        intraday: build_intraday_series(klines_3m),
        longer_term: build_longer_term(klines_4h),
        open_interest,
        funding_rate,
    }
}

/// 日内序列：对最近的每个点在其前缀上计算指标
fn build_intraday_series(klines: &[Kline]) -> IntradaySeries {
    let mut series = IntradaySeries::default();
    let start = klines.len().saturating_sub(INTRADAY_POINTS);

    let obv_values = indicator::obv_series(klines);
    let obv_start = obv_values.len().saturating_sub(INTRADAY_POINTS);
    series.obv = obv_values[obv_start..].to_vec();

    for i in start..klines.len() {
        let prefix = &klines[..=i];
        series.mid_prices.push(klines[i].close);
        if i >= 19 {
            series.ema20.push(indicator::ema(prefix, 20));
        }
        if i >= 25 {
            series.macd.push(indicator::macd(prefix));
        }
        if i >= 7 {
            series.rsi7.push(indicator::rsi(prefix, 7));
        }
        if i >= 14 {
            series.rsi14.push(indicator::rsi(prefix, 14));
        }
    }
    series
}

fn build_longer_term(klines: &[Kline]) -> LongerTermBundle {
    LongerTermBundle {
        ema20: indicator::ema(klines, 20),
        ema50: indicator::ema(klines, 50),
        atr3: indicator::atr(klines, 3),
        atr14: indicator::atr(klines, 14),
        current_volume: klines.last().map(|k| k.volume).unwrap_or(0.0),
        average_volume: indicator::volume_ma(klines, 20),
    }
}

/// OKX公共行情数据源（无需签名）
pub struct OkxMarketData {
    client: reqwest::Client,
    base_url: String,
}

impl Default for OkxMarketData {
    fn default() -> Self {
        Self::new()
    }
}

impl OkxMarketData {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("构建HTTP客户端失败"),
            base_url: "https://www.okx.com".to_string(),
        }
    }

    fn to_inst_id(symbol: &str) -> String {
        let normalized = normalize_symbol(symbol);
        let base = normalized.trim_end_matches("USDT");
        format!("{}-USDT-SWAP", base)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ExchangeError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("请求失败: {}", e)))?;
        let envelope: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("解析响应失败: {}", e)))?;
        let code = envelope["code"].as_str().unwrap_or("");
        if code != "0" {
            return Err(ExchangeError::Api {
                code: code.to_string(),
                msg: envelope["msg"].as_str().unwrap_or("").to_string(),
            });
        }
        Ok(envelope["data"].clone())
    }

    /// 拉取K线并转换为旧在前的序列
    async fn fetch_klines(
        &self,
        symbol: &str,
        bar: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let data = self
            .get_json(&format!(
                "/api/v5/market/candles?instId={}&bar={}&limit={}",
                Self::to_inst_id(symbol),
                bar,
                limit
            ))
            .await?;
        let rows = data.as_array().cloned().unwrap_or_default();

        // OKX返回新在前，反转为旧在前
        let mut klines = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let cols = row.as_array().cloned().unwrap_or_default();
            let field = |i: usize| -> f64 {
                cols.get(i)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            klines.push(Kline {
                ts: cols
                    .first()
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0),
                open: field(1),
                high: field(2),
                low: field(3),
                close: field(4),
                volume: field(5),
            });
        }
        if klines.is_empty() {
            return Err(ExchangeError::Api {
                code: "empty".to_string(),
                msg: format!("{} {} K线数据为空", symbol, bar),
            });
        }
        Ok(klines)
    }

    async fn fetch_ticker_price(&self, symbol: &str) -> Option<f64> {
        let data = self
            .get_json(&format!(
                "/api/v5/market/ticker?instId={}",
                Self::to_inst_id(symbol)
            ))
            .await
            .ok()?;
        data.as_array()?
            .first()?
            .get("last")?
            .as_str()?
            .parse::<f64>()
            .ok()
    }

    async fn fetch_open_interest(&self, symbol: &str) -> OiData {
        let result = self
            .get_json(&format!(
                "/api/v5/public/open-interest?instId={}",
                Self::to_inst_id(symbol)
            ))
            .await;
        match result {
            Ok(data) => {
                let latest = data
                    .as_array()
                    .and_then(|rows| rows.first())
                    .and_then(|row| row.get("oiCcy"))
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                OiData {
                    latest,
                    average: latest,
                }
            }
            Err(e) => {
                warn!("获取 {} OI数据失败: {}", symbol, e);
                OiData::default()
            }
        }
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> f64 {
        self.get_json(&format!(
            "/api/v5/public/funding-rate?instId={}",
            Self::to_inst_id(symbol)
        ))
        .await
        .ok()
        .and_then(|data| {
            data.as_array()?
                .first()?
                .get("fundingRate")?
                .as_str()?
                .parse::<f64>()
                .ok()
        })
        .unwrap_or(0.0)
    }
}

#[async_trait]
impl MarketDataSource for OkxMarketData {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let klines_3m = self.fetch_klines(symbol, "3m", DEFAULT_KLINE_LIMIT).await?;
        let klines_4h = self.fetch_klines(symbol, "4H", DEFAULT_KLINE_LIMIT).await?;
        let ticker = self.fetch_ticker_price(symbol).await;
        if ticker.is_none() {
            warn!("获取 {} 实时价格失败，使用K线收盘价", symbol);
        }
        let oi = self.fetch_open_interest(symbol).await;
        let funding = self.fetch_funding_rate(symbol).await;
        Ok(build_snapshot(
            symbol, &klines_3m, &klines_4h, ticker, oi, funding,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(ts: i64, close: f64) -> Kline {
        Kline {
            ts,
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 1000.0,
        }
    }

    fn make_series(n: usize, base: f64) -> Vec<Kline> {
        (0..n)
            .map(|i| kline(i as i64, base + (i % 7) as f64))
            .collect()
    }

    #[test]
    fn test_snapshot_uses_ticker_price_when_available() {
        let k3m = make_series(300, 100.0);
        let k4h = make_series(300, 100.0);
        let snap = build_snapshot("btc", &k3m, &k4h, Some(123.45), OiData::default(), 0.0001);
        assert_eq!(snap.symbol, "BTCUSDT");
        assert!((snap.current_price - 123.45).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_falls_back_to_last_close() {
        let k3m = make_series(300, 100.0);
        let k4h = make_series(300, 100.0);
        let last_close = k3m.last().unwrap().close;
        let snap = build_snapshot("BTCUSDT", &k3m, &k4h, None, OiData::default(), 0.0);
        assert!((snap.current_price - last_close).abs() < 1e-9);
    }

    #[test]
    fn test_price_change_1h_window() {
        // 构造价格恒定但1小时前不同的序列
        let mut k3m = make_series(300, 100.0);
        let n = k3m.len();
        for k in k3m.iter_mut() {
            k.close = 100.0;
        }
        k3m[n - 21].close = 80.0;
        let k4h = make_series(300, 100.0);
        let snap = build_snapshot("BTCUSDT", &k3m, &k4h, Some(100.0), OiData::default(), 0.0);
        assert!((snap.price_change_1h - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_intraday_series_bounded() {
        let k3m = make_series(300, 50.0);
        let k4h = make_series(300, 50.0);
        let snap = build_snapshot("ETHUSDT", &k3m, &k4h, None, OiData::default(), 0.0);
        assert_eq!(snap.intraday.mid_prices.len(), 20);
        assert_eq!(snap.intraday.ema20.len(), 20);
        assert_eq!(snap.intraday.obv.len(), 20);
    }
}
