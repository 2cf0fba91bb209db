//! 自动交易引擎
//!
//! 每个交易员一个引擎实例，独占自己的周期计数、首次见仓时间表与
//! 余额同步状态。主循环按扫描间隔触发周期：风控检查 → 余额自动同步 →
//! 构建上下文 → AI决策 → 验证 → 按优先级执行 → 写周期记录。
//! 上一周期未结束时丢弃本次tick，同一交易员的两个周期绝不并发。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{AppError, ExchangeError};
use crate::time_util;
use crate::trading::ai::LlmApi;
use crate::trading::config::{BalanceSyncBasis, ConfigStore, TraderConfig};
use crate::trading::decision::prompt::BUILTIN_DEFAULT_TEMPLATE;
use crate::trading::decision::{
    self, sort_decisions_by_priority, AccountInfo, Context, Decision, PositionInfo,
};
use crate::trading::exchange::{ExchangeTrader, PosSide};
use crate::trading::journal::{
    AccountSnapshot, ActionRecord, CycleRecord, DecisionJournal, PositionSnapshot,
};
use crate::trading::market::MarketDataSource;
use crate::trading::pool::{CandidateCoin, SignalSources};
use crate::trading::trader::monitor::DrawdownMonitor;

/// 余额自动同步间隔
const BALANCE_SYNC_INTERVAL: Duration = Duration::from_secs(600);
/// 触发余额替换的变化阈值（百分比）
const BALANCE_SYNC_THRESHOLD_PCT: f64 = 5.0;
/// 日盈亏重置间隔
const DAILY_RESET_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// 历史表现分析的周期数
const PERFORMANCE_WINDOW: usize = 100;
/// 传给AI的历史决策条数
const HISTORY_DECISIONS: usize = 3;
/// 信号源币种池取排名前多少个
const COIN_POOL_LIMIT: usize = 20;
/// 风控暂停的默认时长
const DEFAULT_HALT: Duration = Duration::from_secs(3600);
/// 动作间的间隔，对交易所限频友好
const ACTION_PAUSE: Duration = Duration::from_secs(1);

/// 初始余额偏差是否达到替换阈值
pub fn balance_needs_sync(declared: f64, actual: f64) -> bool {
    if declared <= 0.0 {
        return true;
    }
    ((actual - declared) / declared * 100.0).abs() > BALANCE_SYNC_THRESHOLD_PCT
}

pub struct AutoTrader {
    config: TraderConfig,
    exchange: Arc<dyn ExchangeTrader>,
    llm: Arc<dyn LlmApi>,
    market: Arc<dyn MarketDataSource>,
    store: Arc<dyn ConfigStore>,
    signals: Arc<SignalSources>,
    journal: Arc<DecisionJournal>,
    monitor: Arc<DrawdownMonitor>,

    initial_balance: f64,
    cycle_number: u64,
    started_at: Instant,
    last_reset: Instant,
    daily_start_equity: f64,
    daily_pnl: f64,
    /// 风控暂停截止时间（UTC毫秒），0表示未暂停
    stop_until_ms: i64,
    /// 观察到的最高账户净值（最大回撤风控用）
    peak_equity: f64,
    last_balance_sync: Instant,
    /// 持仓首次出现时间 symbol_side -> 毫秒
    first_seen: HashMap<String, i64>,
}

impl AutoTrader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TraderConfig,
        exchange: Arc<dyn ExchangeTrader>,
        llm: Arc<dyn LlmApi>,
        market: Arc<dyn MarketDataSource>,
        store: Arc<dyn ConfigStore>,
        signals: Arc<SignalSources>,
        journal: Arc<DecisionJournal>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let monitor = Arc::new(DrawdownMonitor::new(config.name.clone(), exchange.clone()));
        // 周期号接着上次的记录继续，保持严格递增且连续
        let cycle_number = journal.last_cycle_number();
        Ok(Self {
            initial_balance: config.initial_balance,
            monitor,
            cycle_number,
            started_at: Instant::now(),
            last_reset: Instant::now(),
            daily_start_equity: 0.0,
            daily_pnl: 0.0,
            stop_until_ms: 0,
            peak_equity: 0.0,
            last_balance_sync: Instant::now(),
            first_seen: HashMap::new(),
            config,
            exchange,
            llm,
            market,
            store,
            signals,
            journal,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn cycle_number(&self) -> u64 {
        self.cycle_number
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn monitor_handle(&self) -> Arc<DrawdownMonitor> {
        self.monitor.clone()
    }

    /// 手动进入风控暂停
    pub fn halt(&mut self) {
        let duration = self
            .config
            .stop_trading_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HALT);
        self.stop_until_ms = chrono::Utc::now().timestamp_millis() + duration.as_millis() as i64;
        warn!(
            "[{}] 进入风控暂停，持续 {:?}",
            self.config.name, duration
        );
    }

    fn halted_remaining(&self) -> Option<Duration> {
        let now = chrono::Utc::now().timestamp_millis();
        if self.stop_until_ms > now {
            Some(Duration::from_millis((self.stop_until_ms - now) as u64))
        } else {
            None
        }
    }

    /// 主循环：首个周期立即执行，此后按扫描间隔触发；
    /// 周期执行期间错过的tick被丢弃，停止信号不打断进行中的交易所调用。
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!(
            "[{}] AI驱动自动交易启动 | 初始余额: {:.2} USDT | 扫描间隔: {:?}",
            self.config.name,
            self.initial_balance,
            self.config.scan_interval()
        );

        let mut interval = tokio::time::interval(self.config.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    if let Err(e) = self.run_cycle().await {
                        error!("[{}] 周期执行失败: {}", self.config.name, e);
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[{}] 自动交易停止", self.config.name);
    }

    /// 执行一个完整的决策周期
    pub async fn run_cycle(&mut self) -> Result<(), AppError> {
        self.cycle_number += 1;
        let cycle_start_ms = chrono::Utc::now().timestamp_millis();
        info!(
            "[{}] AI决策周期 #{} 开始",
            self.config.name, self.cycle_number
        );

        let mut record = CycleRecord {
            cycle_number: self.cycle_number,
            timestamp_ms: cycle_start_ms,
            success: true,
            ..CycleRecord::default()
        };

        // 1. 风控暂停检查
        if let Some(remaining) = self.halted_remaining() {
            let msg = format!("风险控制暂停中，剩余 {:.0} 分钟", remaining.as_secs_f64() / 60.0);
            info!("[{}] {}", self.config.name, msg);
            record.success = false;
            record.error_message = msg;
            self.journal.log_cycle_best_effort(&record).await;
            return Ok(());
        }

        // 2. 日盈亏重置
        if self.last_reset.elapsed() > DAILY_RESET_INTERVAL {
            self.daily_pnl = 0.0;
            self.daily_start_equity = 0.0;
            self.last_reset = Instant::now();
            info!("[{}] 日盈亏已重置", self.config.name);
        }

        // 3. 余额自动同步（每10分钟检查一次，充值/提现后自动更新）
        if self.last_balance_sync.elapsed() >= BALANCE_SYNC_INTERVAL {
            self.auto_sync_balance().await;
        }

        // 4. 收集交易上下文
        let mut ctx = match self.build_context(&mut record).await {
            Ok(ctx) => ctx,
            Err(e) => {
                record.success = false;
                record.error_message = format!("构建交易上下文失败: {}", e);
                self.journal.log_cycle_best_effort(&record).await;
                return Err(e);
            }
        };

        // 风控检查：日亏损或净值回撤达到配置上限则暂停交易
        if let Some(reason) = self.risk_violation() {
            self.halt();
            record.success = false;
            record.error_message = reason;
            self.journal.log_cycle_best_effort(&record).await;
            return Ok(());
        }

        // 5. 调用AI获取决策
        let template = match self.store.prompt_template(&self.config.prompt_template).await {
            Some(t) => t.content,
            None => {
                if self.config.prompt_template != "default" {
                    warn!(
                        "[{}] 提示词模板 '{}' 不存在，使用内置默认模板",
                        self.config.name, self.config.prompt_template
                    );
                }
                BUILTIN_DEFAULT_TEMPLATE.to_string()
            }
        };

        let full = match decision::get_full_decision(
            &mut ctx,
            self.llm.as_ref(),
            self.market.as_ref(),
            &template,
            self.config.custom_prompt.as_deref(),
            self.config.override_base_prompt,
        )
        .await
        {
            Ok(full) => full,
            Err(failure) => {
                // 失败也保留prompt与思维链，便于离线诊断
                if let Some(partial) = failure.partial {
                    record.system_prompt = partial.system_prompt;
                    record.input_prompt = partial.user_prompt;
                    record.cot_trace = partial.cot_trace;
                    record.decisions = partial.decisions;
                }
                record.success = false;
                record.error_message = failure.message.clone();
                self.journal.log_cycle_best_effort(&record).await;
                return Err(AppError::DecisionError(failure.message));
            }
        };

        record.system_prompt = full.system_prompt.clone();
        record.input_prompt = full.user_prompt.clone();
        record.cot_trace = full.cot_trace.clone();
        record.decisions = full.decisions.clone();

        if full.decisions.is_empty() {
            warn!("[{}] AI未生成任何决策", self.config.name);
            record.success = false;
            record.error_message = "AI未生成任何决策".to_string();
            self.journal.log_cycle_best_effort(&record).await;
            return Ok(());
        }

        // 6. 排序执行：先平仓释放保证金，后开仓
        let sorted = sort_decisions_by_priority(&full.decisions);
        for d in &sorted {
            info!("[{}] 执行决策: {} {}", self.config.name, d.symbol, d.action);
            let mut action_record = ActionRecord {
                action: d.action.clone(),
                symbol: d.symbol.clone(),
                leverage: d.leverage,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                ..ActionRecord::default()
            };

            match self.execute_decision(d, &mut action_record).await {
                Ok(()) => {
                    action_record.success = true;
                    record
                        .execution_log
                        .push(format!("{} {} 成功", d.symbol, d.action));
                    // 成功执行后短暂延迟
                    tokio::time::sleep(ACTION_PAUSE).await;
                }
                Err(e) => {
                    error!(
                        "[{}] 执行决策失败: {} {}: {}",
                        self.config.name, d.symbol, d.action, e
                    );
                    action_record.error = e.to_string();
                    record
                        .execution_log
                        .push(format!("{} {} 失败: {}", d.symbol, d.action, e));
                    record.success = false;
                }
            }
            record.actions.push(action_record);
        }

        // 7. 保存决策记录
        self.journal.log_cycle_best_effort(&record).await;
        Ok(())
    }

    /// 构建交易上下文，同时填充周期记录的账户与持仓快照
    async fn build_context(&mut self, record: &mut CycleRecord) -> Result<Context, AppError> {
        let balance = self.exchange.get_balance().await?;
        let positions = self.exchange.get_positions().await?;

        // 维护首次见仓时间；消失的持仓条目清理
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut live_keys: HashSet<String> = HashSet::new();
        for pos in &positions {
            let key = format!("{}_{}", pos.symbol, pos.side);
            live_keys.insert(key.clone());
            self.first_seen.entry(key).or_insert(now_ms);
        }
        self.first_seen.retain(|key, _| live_keys.contains(key));

        let mut total_margin_used = 0.0;
        let mut position_infos = Vec::with_capacity(positions.len());
        for pos in &positions {
            total_margin_used += pos.margin_used;
            let key = format!("{}_{}", pos.symbol, pos.side);
            position_infos.push(PositionInfo {
                symbol: pos.symbol.clone(),
                side: pos.side.to_string(),
                entry_price: pos.entry_price,
                mark_price: pos.mark_price,
                quantity: pos.quantity,
                leverage: pos.leverage,
                unrealized_pnl: pos.unrealized_pnl,
                unrealized_pnl_pct: pos.unrealized_pnl_pct,
                liquidation_price: pos.liquidation_price,
                margin_used: pos.margin_used,
                first_seen_ms: self.first_seen.get(&key).copied().unwrap_or(now_ms),
            });
        }

        let total_equity = if balance.total_equity > 0.0 {
            balance.total_equity
        } else {
            balance.total_wallet + balance.unrealized_pnl
        };

        // 日内盈亏跟踪：以当天首次观察到的净值为基准
        if self.daily_start_equity <= 0.0 {
            self.daily_start_equity = total_equity;
        }
        self.daily_pnl = total_equity - self.daily_start_equity;
        if total_equity > self.peak_equity {
            self.peak_equity = total_equity;
        }

        let total_pnl = total_equity - self.initial_balance;
        let total_pnl_pct = if self.initial_balance > 0.0 {
            total_pnl / self.initial_balance * 100.0
        } else {
            0.0
        };
        let margin_used_pct = if balance.margin_ratio > 0.0 {
            balance.margin_ratio * 100.0
        } else if total_equity > 0.0 {
            total_margin_used / total_equity * 100.0
        } else {
            0.0
        };

        let candidate_coins = self.candidate_coins().await?;

        // 历史表现与最近决策（用于连续性分析）
        let performance = Some(self.journal.analyze_performance(PERFORMANCE_WINDOW));
        let current_cycle = self.cycle_number;
        let history: Vec<_> = self
            .journal
            .latest_records(HISTORY_DECISIONS + 1)
            .into_iter()
            .filter(|r| r.cycle_number < current_cycle)
            .collect();
        let skip = history.len().saturating_sub(HISTORY_DECISIONS);
        let history_decisions = history[skip..]
            .iter()
            .map(|r| decision::HistoryDecision {
                cycle_number: r.cycle_number,
                timestamp: time_util::mill_time_to_datetime(r.timestamp_ms)
                    .unwrap_or_default(),
                decisions: r.decisions.clone(),
                cot_trace: r.cot_trace.clone(),
            })
            .collect();

        // 周期记录快照
        record.account = AccountSnapshot {
            total_equity,
            available_balance: balance.available,
            total_unrealized_profit: balance.unrealized_pnl,
            margin_used_pct,
            position_count: position_infos.len(),
        };
        record.positions = positions
            .iter()
            .map(|p| PositionSnapshot {
                symbol: p.symbol.clone(),
                side: p.side.to_string(),
                quantity: p.quantity,
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                unrealized_pnl: p.unrealized_pnl,
                leverage: p.leverage,
                liquidation_price: p.liquidation_price,
            })
            .collect();
        record.candidate_coins = candidate_coins.iter().map(|c| c.symbol.clone()).collect();

        info!(
            "[{}] 账户净值: {:.2} USDT | 可用: {:.2} USDT | 持仓: {}",
            self.config.name,
            total_equity,
            balance.available,
            position_infos.len()
        );

        Ok(Context {
            current_time: time_util::now_display_string(),
            runtime_minutes: self.started_at.elapsed().as_secs() as i64 / 60,
            cycle_number: self.cycle_number,
            btc_eth_leverage: self.config.btc_eth_leverage,
            altcoin_leverage: self.config.altcoin_leverage,
            account: AccountInfo {
                total_equity,
                available_balance: balance.available,
                total_pnl,
                total_pnl_pct,
                margin_used: total_margin_used,
                margin_used_pct,
                position_count: position_infos.len(),
            },
            positions: position_infos,
            candidate_coins,
            market_map: HashMap::new(),
            performance,
            history_decisions,
        })
    }

    /// 候选币种列表：自定义列表优先，否则按配置启用的信号源合并
    async fn candidate_coins(&self) -> Result<Vec<CandidateCoin>, AppError> {
        if !self.config.trading_coins.is_empty() {
            let coins: Vec<CandidateCoin> = self
                .config
                .trading_coins
                .iter()
                .map(|c| CandidateCoin {
                    symbol: crate::trading::config::normalize_symbol(c),
                    sources: vec!["custom".to_string()],
                })
                .collect();
            info!(
                "[{}] 使用自定义币种: {}个",
                self.config.name,
                coins.len()
            );
            return Ok(coins);
        }

        let coins = match (self.config.use_coin_pool, self.config.use_oi_top) {
            (true, true) => self.signals.merged_pool(COIN_POOL_LIMIT).await?,
            (true, false) => self
                .signals
                .coin_pool(COIN_POOL_LIMIT)
                .await?
                .into_iter()
                .map(|symbol| CandidateCoin {
                    symbol,
                    sources: vec!["coin_pool".to_string()],
                })
                .collect(),
            (false, true) => self
                .signals
                .oi_top()
                .await?
                .into_iter()
                .map(|entry| CandidateCoin {
                    symbol: entry.symbol,
                    sources: vec!["oi_top".to_string()],
                })
                .collect(),
            (false, false) => Vec::new(),
        };
        info!(
            "[{}] 信号源候选币种: {}个",
            self.config.name,
            coins.len()
        );
        Ok(coins)
    }

    /// 余额自动同步：偏差超过5%（或初始余额非法）时替换并持久化。
    /// 不含时间闸门，调用方负责10分钟节流。
    pub async fn auto_sync_balance(&mut self) {
        self.last_balance_sync = Instant::now();

        let balance = match self.exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                // 失败也推进时间戳，避免频繁重试
                warn!("[{}] 查询余额失败: {}", self.config.name, e);
                return;
            }
        };

        let mut actual = match self.config.balance_sync_basis {
            BalanceSyncBasis::Available => balance.available,
            BalanceSyncBasis::Equity => balance.total_equity,
        };
        if actual <= 0.0 {
            actual = balance.total_wallet;
        }
        if actual <= 0.0 {
            warn!("[{}] 无法提取有效余额，跳过同步", self.config.name);
            return;
        }

        let old = self.initial_balance;
        if !balance_needs_sync(old, actual) {
            info!(
                "[{}] 余额变化不大 ({:.2} -> {:.2})，无需更新",
                self.config.name, old, actual
            );
            return;
        }

        if old <= 0.0 {
            warn!(
                "[{}] 初始余额无效 ({:.2})，直接更新为实际余额 {:.2} USDT",
                self.config.name, old, actual
            );
        } else {
            info!(
                "[{}] 检测到余额大幅变化: {:.2} -> {:.2} USDT ({:+.2}%)",
                self.config.name,
                old,
                actual,
                (actual - old) / old * 100.0
            );
        }

        self.initial_balance = actual;
        if let Err(e) = self
            .store
            .update_initial_balance(&self.config.id, actual)
            .await
        {
            error!("[{}] 同步余额到配置存储失败: {}", self.config.name, e);
        }
    }

    /// 执行单条已验证的决策并填写动作记录
    async fn execute_decision(
        &mut self,
        d: &Decision,
        record: &mut ActionRecord,
    ) -> Result<(), AppError> {
        match d.action.as_str() {
            "open_long" => self.execute_open(d, PosSide::Long, record).await,
            "open_short" => self.execute_open(d, PosSide::Short, record).await,
            "close_long" => self.execute_close(d, PosSide::Long, record).await,
            "close_short" => self.execute_close(d, PosSide::Short, record).await,
            "update_stop_loss" => self.execute_update_protection(d, true, record).await,
            "update_take_profit" => self.execute_update_protection(d, false, record).await,
            "partial_close" => self.execute_partial_close(d, record).await,
            // 观望动作只记录不执行
            "hold" | "wait" => Ok(()),
            other => Err(AppError::DecisionError(format!("未知的action: {}", other))),
        }
    }

    async fn execute_open(
        &mut self,
        d: &Decision,
        side: PosSide,
        record: &mut ActionRecord,
    ) -> Result<(), AppError> {
        // 验证层保证开仓字段存在
        let leverage = d
            .leverage
            .ok_or_else(|| AppError::DecisionError("开仓缺少leverage".to_string()))?;
        let size_usd = d
            .position_size_usd
            .ok_or_else(|| AppError::DecisionError("开仓缺少position_size_usd".to_string()))?;

        let mark = self.exchange.get_mark_price(&d.symbol).await?;
        let quantity = size_usd / mark;
        record.quantity = quantity;
        record.price = mark;

        // 仓位模式设置失败不影响交易
        if let Err(e) = self
            .exchange
            .set_margin_mode(&d.symbol, self.config.exchange.is_cross_margin)
            .await
        {
            warn!("[{}] 设置仓位模式失败: {}", self.config.name, e);
        }
        self.exchange
            .set_leverage(&d.symbol, Some(side), leverage)
            .await?;

        let result = self
            .exchange
            .open(&d.symbol, side, quantity, leverage, d.stop_loss, d.take_profit)
            .await?;
        record.order_id = result.order_id;
        record.quantity = result.quantity;

        // 记录开仓时间
        self.first_seen.insert(
            format!("{}_{}", d.symbol, side),
            chrono::Utc::now().timestamp_millis(),
        );
        info!(
            "[{}] 开{}仓成功: {} 数量: {:.8}",
            self.config.name, side, d.symbol, result.quantity
        );
        Ok(())
    }

    async fn execute_close(
        &mut self,
        d: &Decision,
        side: PosSide,
        record: &mut ActionRecord,
    ) -> Result<(), AppError> {
        if let Ok(mark) = self.exchange.get_mark_price(&d.symbol).await {
            record.price = mark;
        }
        let result = self.exchange.close(&d.symbol, side, 0.0).await?;
        record.order_id = result.order_id;
        record.quantity = result.quantity;

        // 平仓后清理残留的保护性挂单
        if let Err(e) = self.exchange.cancel_all_orders(&d.symbol).await {
            warn!("[{}] 取消残留挂单失败: {}", self.config.name, e);
        }
        info!("[{}] 平{}仓成功: {}", self.config.name, side, d.symbol);
        Ok(())
    }

    /// 调整止损（is_stop_loss=true）或止盈。只取消对应一侧的保护单。
    async fn execute_update_protection(
        &mut self,
        d: &Decision,
        is_stop_loss: bool,
        record: &mut ActionRecord,
    ) -> Result<(), AppError> {
        let new_price = if is_stop_loss {
            d.new_stop_loss
        } else {
            d.new_take_profit
        }
        .ok_or_else(|| AppError::DecisionError("缺少新的保护价格".to_string()))?;

        let mark = self.exchange.get_mark_price(&d.symbol).await?;
        record.price = mark;

        let positions = self.exchange.get_positions().await?;
        let target = positions
            .iter()
            .find(|p| p.symbol == d.symbol && p.quantity != 0.0)
            .ok_or_else(|| {
                AppError::ExchangeError(ExchangeError::NoSuchPosition(d.symbol.clone()))
            })?;

        // 新价格与当前价的合理性
        match (is_stop_loss, target.side) {
            (true, PosSide::Long) if new_price >= mark => {
                return Err(AppError::DecisionError(format!(
                    "多单止损必须低于当前价格 (当前: {:.2}, 新止损: {:.2})",
                    mark, new_price
                )));
            }
            (true, PosSide::Short) if new_price <= mark => {
                return Err(AppError::DecisionError(format!(
                    "空单止损必须高于当前价格 (当前: {:.2}, 新止损: {:.2})",
                    mark, new_price
                )));
            }
            (false, PosSide::Long) if new_price <= mark => {
                return Err(AppError::DecisionError(format!(
                    "多单止盈必须高于当前价格 (当前: {:.2}, 新止盈: {:.2})",
                    mark, new_price
                )));
            }
            (false, PosSide::Short) if new_price >= mark => {
                return Err(AppError::DecisionError(format!(
                    "空单止盈必须低于当前价格 (当前: {:.2}, 新止盈: {:.2})",
                    mark, new_price
                )));
            }
            _ => {}
        }

        // 双向持仓按规则不应存在，出现时取消操作会波及另一方向的保护单。
        // 仅告警并继续：取消按symbol范围进行，不构成安全问题。
        if let Some(opposite) = positions
            .iter()
            .find(|p| p.symbol == d.symbol && p.side == target.side.opposite() && p.quantity != 0.0)
        {
            warn!(
                "[{}] 检测到 {} 存在双向持仓（{} + {}），违反策略规则，请检查是否有手动操作",
                self.config.name, d.symbol, target.side, opposite.side
            );
        }

        let side = target.side;
        let quantity = target.quantity;

        // 只取消对应一侧，保留另一侧的保护单
        let cancel_result = if is_stop_loss {
            self.exchange.cancel_stop_loss_orders(&d.symbol).await
        } else {
            self.exchange.cancel_take_profit_orders(&d.symbol).await
        };
        if let Err(e) = cancel_result {
            warn!("[{}] 取消旧保护单失败: {}", self.config.name, e);
        }

        if is_stop_loss {
            self.exchange
                .set_stop_loss(&d.symbol, side, quantity, new_price)
                .await?;
            info!(
                "[{}] 止损已调整: {} -> {:.4} (当前价格: {:.4})",
                self.config.name, d.symbol, new_price, mark
            );
        } else {
            self.exchange
                .set_take_profit(&d.symbol, side, quantity, new_price)
                .await?;
            info!(
                "[{}] 止盈已调整: {} -> {:.4} (当前价格: {:.4})",
                self.config.name, d.symbol, new_price, mark
            );
        }
        record.quantity = quantity;
        Ok(())
    }

    async fn execute_partial_close(
        &mut self,
        d: &Decision,
        record: &mut ActionRecord,
    ) -> Result<(), AppError> {
        let pct = d
            .close_percentage
            .ok_or_else(|| AppError::DecisionError("缺少close_percentage".to_string()))?;

        if let Ok(mark) = self.exchange.get_mark_price(&d.symbol).await {
            record.price = mark;
        }

        let positions = self.exchange.get_positions().await?;
        let target = positions
            .iter()
            .find(|p| p.symbol == d.symbol && p.quantity != 0.0)
            .ok_or_else(|| {
                AppError::ExchangeError(ExchangeError::NoSuchPosition(d.symbol.clone()))
            })?;

        let close_qty = target.quantity.abs() * pct / 100.0;
        record.quantity = close_qty;
        let result = self
            .exchange
            .close(&d.symbol, target.side, close_qty)
            .await?;
        record.order_id = result.order_id;
        info!(
            "[{}] 部分平仓成功: {} 平仓 {:.8} ({:.1}%), 剩余 {:.8}",
            self.config.name,
            d.symbol,
            close_qty,
            pct,
            target.quantity - close_qty
        );
        Ok(())
    }

    /// 风控提示检查：日亏损上限与净值最大回撤，任一越界返回原因
    fn risk_violation(&self) -> Option<String> {
        if let Some(max_loss) = self.config.max_daily_loss_pct {
            if self.initial_balance > 0.0
                && self.daily_pnl / self.initial_balance * 100.0 <= -max_loss.abs()
            {
                return Some(format!("日亏损达到上限 {:.1}%，暂停交易", max_loss.abs()));
            }
        }
        if let Some(max_dd) = self.config.max_drawdown_pct {
            let equity = self.daily_start_equity + self.daily_pnl;
            if self.peak_equity > 0.0
                && (self.peak_equity - equity) / self.peak_equity * 100.0 >= max_dd.abs()
            {
                return Some(format!("净值回撤达到上限 {:.1}%，暂停交易", max_dd.abs()));
            }
        }
        None
    }

    /// 首次见仓时间表快照（测试与状态接口）
    pub fn first_seen_snapshot(&self) -> HashMap<String, i64> {
        self.first_seen.clone()
    }
}
