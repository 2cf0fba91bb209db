//! 候选币种信号源
//!
//! 两个黑盒HTTP信号源：币种池（排名靠前的强势币）与持仓量增长Top。
//! 任一信号源可由配置禁用；两者都是排名列表，合并时记录每个symbol的来源。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AppError;
use crate::trading::config::normalize_symbol;

/// 候选币种及其来源标签
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    /// 来源: "default" / "custom" / "coin_pool" / "oi_top"
    pub sources: Vec<String>,
}

/// OI Top条目（用于AI决策参考）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OiTopEntry {
    pub symbol: String,
    pub rank: u32,
    #[serde(default)]
    pub oi_delta_percent: f64,
    #[serde(default)]
    pub price_delta_percent: f64,
}

#[derive(Debug, Deserialize)]
struct RankedSymbolsResponse {
    #[serde(default)]
    symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OiTopResponse {
    #[serde(default)]
    data: Vec<OiTopEntry>,
}

/// 信号源客户端
///
/// 币种池结果短暂缓存（60秒），避免多个交易员同周期重复拉取；
/// 进程内显式构造后注入各交易员，测试可替换base_url指向fake服务。
pub struct SignalSources {
    client: reqwest::Client,
    coin_pool_url: Option<String>,
    oi_top_url: Option<String>,
    pool_cache: RwLock<Option<(Vec<String>, Instant)>>,
}

const POOL_CACHE_TTL: Duration = Duration::from_secs(60);

impl SignalSources {
    pub fn new(coin_pool_url: Option<String>, oi_top_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("构建HTTP客户端失败"),
            coin_pool_url,
            oi_top_url,
            pool_cache: RwLock::new(None),
        }
    }

    /// 禁用全部信号源的空实现
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// 币种池排名列表（带缓存）
    pub async fn coin_pool(&self, limit: usize) -> Result<Vec<String>, AppError> {
        let Some(url) = &self.coin_pool_url else {
            return Ok(Vec::new());
        };

        {
            let cache = self.pool_cache.read().await;
            if let Some((symbols, at)) = cache.as_ref() {
                if at.elapsed() < POOL_CACHE_TTL {
                    return Ok(symbols.iter().take(limit).cloned().collect());
                }
            }
        }

        let resp: RankedSymbolsResponse = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Unknown(format!("币种池请求失败: {}", e)))?
            .json()
            .await
            .map_err(|e| AppError::Unknown(format!("币种池响应解析失败: {}", e)))?;

        let symbols: Vec<String> = resp
            .symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .collect();
        *self.pool_cache.write().await = Some((symbols.clone(), Instant::now()));
        Ok(symbols.into_iter().take(limit).collect())
    }

    /// OI增长Top列表
    pub async fn oi_top(&self) -> Result<Vec<OiTopEntry>, AppError> {
        let Some(url) = &self.oi_top_url else {
            return Ok(Vec::new());
        };
        let resp: OiTopResponse = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Unknown(format!("OI Top请求失败: {}", e)))?
            .json()
            .await
            .map_err(|e| AppError::Unknown(format!("OI Top响应解析失败: {}", e)))?;
        let mut entries = resp.data;
        for e in entries.iter_mut() {
            e.symbol = normalize_symbol(&e.symbol);
        }
        Ok(entries)
    }

    /// 合并币种池与OI Top，每个symbol标记全部来源
    pub async fn merged_pool(&self, pool_limit: usize) -> Result<Vec<CandidateCoin>, AppError> {
        let pool = match self.coin_pool(pool_limit).await {
            Ok(v) => v,
            Err(e) => {
                warn!("获取币种池失败: {}", e);
                Vec::new()
            }
        };
        let oi = match self.oi_top().await {
            Ok(v) => v,
            Err(e) => {
                warn!("获取OI Top失败: {}", e);
                Vec::new()
            }
        };

        let mut order: Vec<String> = Vec::new();
        let mut sources: HashMap<String, Vec<String>> = HashMap::new();
        for symbol in pool {
            if !sources.contains_key(&symbol) {
                order.push(symbol.clone());
            }
            sources
                .entry(symbol)
                .or_default()
                .push("coin_pool".to_string());
        }
        for entry in oi {
            if !sources.contains_key(&entry.symbol) {
                order.push(entry.symbol.clone());
            }
            let tags = sources.entry(entry.symbol).or_default();
            if !tags.iter().any(|t| t == "oi_top") {
                tags.push("oi_top".to_string());
            }
        }

        Ok(order
            .into_iter()
            .map(|symbol| {
                let tags = sources.remove(&symbol).unwrap_or_default();
                CandidateCoin {
                    symbol,
                    sources: tags,
                }
            })
            .collect())
    }
}
