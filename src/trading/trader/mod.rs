//! 交易员子系统：周期引擎、回撤监控与管理器

pub mod engine;
pub mod manager;
pub mod monitor;

pub use engine::AutoTrader;
pub use manager::{TraderManager, TraderState};
pub use monitor::DrawdownMonitor;
