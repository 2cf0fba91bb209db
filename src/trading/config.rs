//! 交易员配置与配置存储
//!
//! TraderConfig是每个交易员实例的不可变配置记录；ConfigStore是外部配置
//! 存储的协作接口，引擎只通过它读取提示词模板、回写修正后的初始余额。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::AppError;

/// AI提供商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// OpenAI兼容的chat-completions接口（DeepSeek/Qwen/ChatGPT/自定义）
    ChatCompletions,
    /// OpenAI Assistant/Thread接口
    Assistant,
}

/// AI配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfile {
    pub provider: LlmProvider,
    pub api_key: String,
    pub model: String,
    /// 为空时使用chat-completions默认地址；以#结尾表示完整URL（不追加路径）
    #[serde(default)]
    pub base_url: Option<String>,
    /// Assistant接口必填
    #[serde(default)]
    pub assistant_id: Option<String>,
    /// 可选的固定thread，跨周期保留上下文
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// 交易所配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeProfile {
    /// 平台标识，如 "okx"
    pub venue: String,
    pub api_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default)]
    pub testnet: bool,
    /// true=全仓, false=逐仓
    #[serde(default)]
    pub is_cross_margin: bool,
}

/// 余额自动同步的比较基准
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSyncBasis {
    /// 用可用余额替换初始余额（原始行为，把初始余额当作可动用本金）
    #[default]
    Available,
    /// 用账户净值替换初始余额
    Equity,
}

/// 交易员配置（AI全权决策）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub id: String,
    pub name: String,
    pub llm: LlmProfile,
    pub exchange: ExchangeProfile,

    /// 扫描间隔（秒）
    pub scan_interval_secs: u64,
    /// 初始金额（用于计算盈亏，必须大于0）
    pub initial_balance: f64,

    /// BTC/ETH杠杆上限
    pub btc_eth_leverage: u32,
    /// 山寨币杠杆上限
    pub altcoin_leverage: u32,

    /// 自定义币种列表；为空时使用信号源
    #[serde(default)]
    pub trading_coins: Vec<String>,
    /// 是否使用币种池信号源
    #[serde(default = "default_true")]
    pub use_coin_pool: bool,
    /// 是否使用持仓量增长信号源
    #[serde(default = "default_true")]
    pub use_oi_top: bool,

    /// 系统提示词模板名称
    #[serde(default = "default_template")]
    pub prompt_template: String,
    /// 用户自定义策略prompt（追加在基础prompt之后）
    #[serde(default)]
    pub custom_prompt: Option<String>,
    /// true时自定义prompt完全取代基础prompt
    #[serde(default)]
    pub override_base_prompt: bool,

    /// 风控提示（仅提示AI，不做硬限制）
    #[serde(default)]
    pub max_daily_loss_pct: Option<f64>,
    #[serde(default)]
    pub max_drawdown_pct: Option<f64>,
    /// 触发风控后暂停时长（秒）
    #[serde(default)]
    pub stop_trading_secs: Option<u64>,

    #[serde(default)]
    pub balance_sync_basis: BalanceSyncBasis,
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    "default".to_string()
}

impl TraderConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    /// 校验配置合法性，创建交易员前调用
    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.is_empty() {
            return Err(AppError::ConfigError("trader id不能为空".to_string()));
        }
        if self.initial_balance <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "初始金额必须大于0: {}",
                self.initial_balance
            )));
        }
        if self.btc_eth_leverage == 0 || self.altcoin_leverage == 0 {
            return Err(AppError::ConfigError("杠杆上限必须大于0".to_string()));
        }
        Ok(())
    }
}

/// 提示词模板
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub content: String,
}

/// 配置存储协作接口
///
/// 引擎视角下read-mostly：读取模板、回写自动同步后的初始余额。
/// 运行中的配置编辑由外层API拒绝，不在此处强制。
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// 按名称取提示词模板
    async fn prompt_template(&self, name: &str) -> Option<PromptTemplate>;

    /// 持久化修正后的初始余额
    async fn update_initial_balance(&self, trader_id: &str, new_balance: f64)
        -> Result<(), AppError>;
}

/// 基于JSON文件的配置存储（NOFX_DB_PATH）
///
/// 生产部署由宿主进程提供真正的数据库实现；该实现服务于单机运行与回放。
pub struct FileConfigStore {
    path: PathBuf,
    state: RwLock<FileStoreState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileStoreState {
    #[serde(default)]
    traders: Vec<TraderConfig>,
    #[serde(default)]
    templates: HashMap<String, String>,
}

impl FileConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?,
            Err(_) => {
                warn!("配置文件 {} 不存在，使用空配置", path.display());
                FileStoreState::default()
            }
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub async fn trader_configs(&self) -> Vec<TraderConfig> {
        self.state.read().await.traders.clone()
    }

    async fn persist(&self, state: &FileStoreState) -> Result<(), AppError> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| AppError::ConfigError(e.to_string()))?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| AppError::ConfigError(format!("写入配置文件失败: {}", e)))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn prompt_template(&self, name: &str) -> Option<PromptTemplate> {
        let state = self.state.read().await;
        state.templates.get(name).map(|content| PromptTemplate {
            name: name.to_string(),
            content: content.clone(),
        })
    }

    async fn update_initial_balance(
        &self,
        trader_id: &str,
        new_balance: f64,
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let Some(cfg) = state.traders.iter_mut().find(|t| t.id == trader_id) else {
            return Err(AppError::ConfigError(format!(
                "trader不存在: {}",
                trader_id
            )));
        };
        cfg.initial_balance = new_balance;
        info!("已同步 {} 初始余额到配置存储: {:.2} USDT", trader_id, new_balance);
        self.persist(&state).await
    }
}

/// 标准化币种符号：大写并保证以USDT结尾
pub fn normalize_symbol(symbol: &str) -> String {
    let mut s = symbol.trim().to_uppercase();
    if !s.ends_with("USDT") {
        s.push_str("USDT");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol(" SOLUSDT "), "SOLUSDT");
        assert_eq!(normalize_symbol("eth"), "ETHUSDT");
    }

    #[test]
    fn test_config_validate() {
        let mut cfg = test_config();
        assert!(cfg.validate().is_ok());
        cfg.initial_balance = 0.0;
        assert!(cfg.validate().is_err());
    }

    pub(crate) fn test_config() -> TraderConfig {
        TraderConfig {
            id: "t1".to_string(),
            name: "Test Trader".to_string(),
            llm: LlmProfile {
                provider: LlmProvider::ChatCompletions,
                api_key: "sk-test".to_string(),
                model: "deepseek-chat".to_string(),
                base_url: None,
                assistant_id: None,
                thread_id: None,
            },
            exchange: ExchangeProfile {
                venue: "okx".to_string(),
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
}
