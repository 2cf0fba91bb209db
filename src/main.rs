use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use ai_quant::trading::ai::LlmClient;
use ai_quant::trading::config::{ConfigStore, FileConfigStore};
use ai_quant::trading::exchange::okx::OkxTrader;
use ai_quant::trading::journal::{resolve_log_root, DecisionJournal};
use ai_quant::trading::market::OkxMarketData;
use ai_quant::trading::pool::SignalSources;
use ai_quant::trading::trader::{AutoTrader, TraderManager};

#[tokio::main]
async fn main() -> Result<()> {
    ai_quant::app_init()?;

    let db_path = std::env::var("NOFX_DB_PATH").unwrap_or_else(|_| "nofx_config.json".to_string());
    let store = Arc::new(FileConfigStore::load(&db_path).context("加载配置存储失败")?);
    let configs = store.trader_configs().await;
    if configs.is_empty() {
        error!("配置存储 {} 中没有任何交易员配置", db_path);
        return Ok(());
    }

    let log_root = resolve_log_root();
    let market = Arc::new(OkxMarketData::new());
    let signals = Arc::new(SignalSources::new(
        std::env::var("COIN_POOL_API_URL").ok(),
        std::env::var("OI_TOP_API_URL").ok(),
    ));

    let manager = Arc::new(TraderManager::new());
    for config in configs {
        let exchange = match config.exchange.venue.as_str() {
            "okx" => Arc::new(OkxTrader::new(
                config.exchange.api_key.clone(),
                config.exchange.secret_key.clone(),
                config.exchange.passphrase.clone(),
                config.exchange.testnet,
                config.exchange.is_cross_margin,
            )),
            other => {
                error!("不支持的交易平台: {}，跳过交易员 {}", other, config.id);
                continue;
            }
        };
        let llm = Arc::new(LlmClient::from_profile(&config.llm));
        let journal = Arc::new(DecisionJournal::new(&log_root, &config.id)?);

        let trader = AutoTrader::new(
            config,
            exchange,
            llm,
            market.clone(),
            store.clone() as Arc<dyn ConfigStore>,
            signals.clone(),
            journal,
        )?;
        manager.start(trader).await?;
    }

    info!("全部交易员已启动，Ctrl-C退出");
    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在停止全部交易员...");
    manager.stop_all().await;
    Ok(())
}
