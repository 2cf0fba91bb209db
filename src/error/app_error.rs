use thiserror::Error;

/// 应用错误
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// AI网关错误
    #[error("AI API错误: {0}")]
    LlmError(String),

    /// 交易所错误
    #[error("交易所错误: {0}")]
    ExchangeError(#[from] ExchangeError),

    /// 决策解析/验证错误
    #[error("决策错误: {0}")]
    DecisionError(String),

    /// 决策日志持久化错误
    #[error("决策日志错误: {0}")]
    JournalError(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

/// 交易所适配器错误
///
/// Transport类错误由适配器内部重试；其余错误直接上抛给执行层，
/// 由执行层记录到周期记录中，不会中断整个决策列表。
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// 网络/IO瞬时故障（重试后仍失败）
    #[error("请求失败: {0}")]
    Transport(String),

    /// 交易所返回的业务错误码
    #[error("交易所API错误: {code} - {msg}")]
    Api { code: String, msg: String },

    /// 取整后保证金不足
    #[error("保证金不足: 需要 {required:.2} USDT，可用 {available:.2} USDT (最小数量 {min_qty:.8})")]
    InsufficientMargin {
        required: f64,
        available: f64,
        min_qty: f64,
    },

    /// 止盈止损价格与当前标记价格/预估爆仓价冲突
    #[error("价格校验失败: {0}")]
    PrecisionReject(String),

    /// 同币种同方向已有持仓，拒绝重复开仓
    #[error("{symbol} 已有{side}仓，拒绝开仓以防止仓位叠加超限")]
    AlreadyOpen { symbol: String, side: String },

    /// 找不到目标持仓
    #[error("持仓不存在: {0}")]
    NoSuchPosition(String),
}

impl ExchangeError {
    /// 判断错误信息是否属于"已满足目标状态"类（杠杆已是目标值、仓位模式已设置等），
    /// 适配器将这类响应折算为成功。
    pub fn is_already_satisfied(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        lower.contains("already") || lower.contains("no need") || lower.contains("position mode")
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
