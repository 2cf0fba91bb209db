pub mod app_config;
pub mod error;
pub mod time_util;
pub mod trading;

use dotenv::dotenv;

/// 进程初始化：加载.env并配置日志
pub fn app_init() -> anyhow::Result<()> {
    dotenv().ok();
    app_config::log::setup_logging()?;
    Ok(())
}
