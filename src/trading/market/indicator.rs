//! 技术指标计算
//!
//! 全部为K线序列上的纯函数。EMA使用SMA作为种子、α=2/(N+1)；
//! RSI与ATR使用Wilder平滑；KDJ按2/3-1/3平滑，J=3K-2D；OBV为带符号
//! 成交量累计。数据不足时返回0（调用方按"指标不可用"处理）。

use super::Kline;

/// EMA（SMA种子）
pub fn ema(klines: &[Kline], period: usize) -> f64 {
    if klines.len() < period || period == 0 {
        return 0.0;
    }

    let mut value: f64 = klines[..period].iter().map(|k| k.close).sum::<f64>() / period as f64;
    let multiplier = 2.0 / (period as f64 + 1.0);
    for k in &klines[period..] {
        value = (k.close - value) * multiplier + value;
    }
    value
}

/// MACD = EMA12 - EMA26
pub fn macd(klines: &[Kline]) -> f64 {
    if klines.len() < 26 {
        return 0.0;
    }
    ema(klines, 12) - ema(klines, 26)
}

/// RSI（Wilder平滑）
pub fn rsi(klines: &[Kline], period: usize) -> f64 {
    if klines.len() <= period || period == 0 {
        return 0.0;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            gains += change;
        } else {
            losses += -change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    let p = period as f64;
    for i in (period + 1)..klines.len() {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            avg_gain = (avg_gain * (p - 1.0) + change) / p;
            avg_loss = (avg_loss * (p - 1.0)) / p;
        } else {
            avg_gain = (avg_gain * (p - 1.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) + (-change)) / p;
        }
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// ATR（Wilder平滑）
pub fn atr(klines: &[Kline], period: usize) -> f64 {
    if klines.len() <= period || period == 0 {
        return 0.0;
    }

    let mut trs = vec![0.0; klines.len()];
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        trs[i] = tr;
    }

    let p = period as f64;
    let mut value: f64 = trs[1..=period].iter().sum::<f64>() / p;
    for tr in &trs[(period + 1)..] {
        value = (value * (p - 1.0) + tr) / p;
    }
    value
}

/// SMA：最近period根K线收盘价均值
pub fn sma(klines: &[Kline], period: usize) -> f64 {
    if klines.len() < period || period == 0 {
        return 0.0;
    }
    let start = klines.len() - period;
    klines[start..].iter().map(|k| k.close).sum::<f64>() / period as f64
}

/// 布林带 (上轨, 中轨, 下轨)，中轨为SMA(period)，带宽为k个标准差
pub fn bollinger_bands(klines: &[Kline], period: usize, k: f64) -> (f64, f64, f64) {
    if klines.len() < period || period == 0 {
        return (0.0, 0.0, 0.0);
    }
    let middle = sma(klines, period);
    let start = klines.len() - period;
    let variance = klines[start..]
        .iter()
        .map(|kl| {
            let d = kl.close - middle;
            d * d
        })
        .sum::<f64>()
        / period as f64;
    let std_dev = variance.sqrt();
    (middle + k * std_dev, middle, middle - k * std_dev)
}

/// KDJ (K, D, J)：RSV -> K=2/3K'+1/3RSV -> D=2/3D'+1/3K -> J=3K-2D
pub fn kdj(klines: &[Kline], period: usize) -> (f64, f64, f64) {
    if klines.len() < period || period == 0 {
        return (50.0, 50.0, 50.0);
    }

    let mut k_value = 50.0;
    let mut d_value = 50.0;
    for i in (period - 1)..klines.len() {
        let window = &klines[(i + 1 - period)..=i];
        let highest = window.iter().map(|x| x.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|x| x.low).fold(f64::MAX, f64::min);
        let rsv = if highest > lowest {
            (klines[i].close - lowest) / (highest - lowest) * 100.0
        } else {
            50.0
        };
        k_value = 2.0 / 3.0 * k_value + 1.0 / 3.0 * rsv;
        d_value = 2.0 / 3.0 * d_value + 1.0 / 3.0 * k_value;
    }
    let j_value = 3.0 * k_value - 2.0 * d_value;
    (k_value, d_value, j_value)
}

/// OBV序列：收盘价上涨加成交量，下跌减成交量
pub fn obv_series(klines: &[Kline]) -> Vec<f64> {
    if klines.len() < 2 {
        return Vec::new();
    }
    let mut values = Vec::with_capacity(klines.len());
    let mut value = 0.0;
    values.push(value);
    for i in 1..klines.len() {
        if klines[i].close > klines[i - 1].close {
            value += klines[i].volume;
        } else if klines[i].close < klines[i - 1].close {
            value -= klines[i].volume;
        }
        values.push(value);
    }
    values
}

/// 最新OBV值
pub fn obv(klines: &[Kline]) -> f64 {
    obv_series(klines).last().copied().unwrap_or(0.0)
}

/// 成交量均线：最近period根K线成交量均值
pub fn volume_ma(klines: &[Kline], period: usize) -> f64 {
    if klines.len() < period || period == 0 {
        return 0.0;
    }
    let start = klines.len() - period;
    klines[start..].iter().map(|k| k.volume).sum::<f64>() / period as f64
}
