use std::env;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber, Layer};

/// 设置日志
///
/// LOCAL环境输出到控制台，其他环境写入按天滚动的 info/error 日志文件。
pub fn setup_logging() -> anyhow::Result<()> {
    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "LOCAL".to_string());
    if app_env.eq_ignore_ascii_case("LOCAL") {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish();
        // 测试中可能重复初始化，忽略二次设置错误
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let info_file = RollingFileAppender::new(Rotation::DAILY, "log_files", "info.log");
        let error_file = RollingFileAppender::new(Rotation::DAILY, "log_files", "error.log");

        let (info_non_blocking, info_guard) = tracing_appender::non_blocking(info_file);
        let (error_non_blocking, error_guard) = tracing_appender::non_blocking(error_file);
        // guard泄漏到进程生命周期，保证缓冲日志在退出前落盘
        std::mem::forget(info_guard);
        std::mem::forget(error_guard);

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(info_non_blocking)
                    .with_filter(EnvFilter::new("info")),
            )
            .with(
                fmt::layer()
                    .with_writer(error_non_blocking)
                    .with_filter(EnvFilter::new("error")),
            )
            .init();
    }

    Ok(())
}
