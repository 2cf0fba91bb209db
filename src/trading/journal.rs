//! 决策日志
//!
//! 按交易员分目录的只追加周期记录，每个周期一个自描述JSON文件，
//! 文件名内嵌UTC时间戳与周期号（字典序即时间序）。记录可离线回放。
//! 持久化失败只记日志，不阻塞周期。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;
use crate::trading::decision::types::{Decision, PerformanceSummary};

/// 账户快照（落盘）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// 持仓快照（落盘）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub liquidation_price: f64,
}

/// 单个动作的执行结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub symbol: String,
    pub quantity: f64,
    #[serde(default)]
    pub leverage: Option<u32>,
    pub price: f64,
    #[serde(default)]
    pub order_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp_ms: i64,
}

/// 一个周期的完整记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    /// 周期开始时间（UTC毫秒）
    pub timestamp_ms: i64,
    pub account: AccountSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub candidate_coins: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub input_prompt: String,
    #[serde(default)]
    pub cot_trace: String,
    /// 修复解析后的决策列表原样落盘
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub execution_log: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
}

/// 解析日志根目录：NOFX_LOG_DIR > /data/decision_logs（/data可写时）> decision_logs
pub fn resolve_log_root() -> PathBuf {
    if let Ok(dir) = std::env::var("NOFX_LOG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let data = Path::new("/data");
    if data.is_dir()
        && data
            .metadata()
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false)
    {
        return PathBuf::from("/data/decision_logs");
    }
    PathBuf::from("decision_logs")
}

/// 按交易员分目录的决策日志
pub struct DecisionJournal {
    dir: PathBuf,
}

impl DecisionJournal {
    /// 在日志根目录下为trader_id建立独立目录
    pub fn new(base_dir: impl Into<PathBuf>, trader_id: &str) -> Result<Self, AppError> {
        let dir = base_dir.into().join(trader_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::JournalError(format!("创建日志目录失败: {}", e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(record: &CycleRecord) -> String {
        let ts = chrono::DateTime::from_timestamp_millis(record.timestamp_ms)
            .unwrap_or_else(chrono::Utc::now)
            .format("%Y%m%dT%H%M%SZ");
        format!("{}_cycle_{:08}.json", ts, record.cycle_number)
    }

    /// 原子写入一条周期记录（tmp+rename）
    pub async fn log_cycle(&self, record: &CycleRecord) -> Result<(), AppError> {
        let raw = serde_json::to_string_pretty(record)
            .map_err(|e| AppError::JournalError(format!("序列化周期记录失败: {}", e)))?;
        let final_path = self.dir.join(Self::file_name(record));
        let tmp_path = final_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, raw)
            .await
            .map_err(|e| AppError::JournalError(format!("写入周期记录失败: {}", e)))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| AppError::JournalError(format!("落盘周期记录失败: {}", e)))?;
        Ok(())
    }

    /// 持久化失败只告警不上抛
    pub async fn log_cycle_best_effort(&self, record: &CycleRecord) {
        if let Err(e) = self.log_cycle(record).await {
            warn!("保存决策记录失败: {}", e);
        }
    }

    fn sorted_record_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.extension().map(|ext| ext == "json").unwrap_or(false)
                            && p.file_name()
                                .and_then(|n| n.to_str())
                                .map(|n| n.contains("_cycle_"))
                                .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// 最近n条记录，从旧到新
    pub fn latest_records(&self, n: usize) -> Vec<CycleRecord> {
        let paths = self.sorted_record_paths();
        let start = paths.len().saturating_sub(n);
        paths[start..]
            .iter()
            .filter_map(|path| {
                let raw = std::fs::read_to_string(path).ok()?;
                match serde_json::from_str::<CycleRecord>(&raw) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("解析周期记录失败 {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .collect()
    }

    /// 已记录的最大周期号（重启后继续连续编号）
    pub fn last_cycle_number(&self) -> u64 {
        self.latest_records(1)
            .first()
            .map(|r| r.cycle_number)
            .unwrap_or(0)
    }

    /// 最近m个周期的表现摘要：胜率、盈亏比、基于周期间净值变化的夏普比率
    pub fn analyze_performance(&self, m: usize) -> PerformanceSummary {
        let records = self.latest_records(m);
        if records.len() < 2 {
            return PerformanceSummary {
                analyzed_cycles: records.len(),
                ..PerformanceSummary::default()
            };
        }

        let mut deltas = Vec::with_capacity(records.len() - 1);
        for pair in records.windows(2) {
            let prev = pair[0].account.total_equity;
            let next = pair[1].account.total_equity;
            if prev > 0.0 {
                deltas.push((next - prev) / prev);
            }
        }
        if deltas.is_empty() {
            return PerformanceSummary {
                analyzed_cycles: records.len(),
                ..PerformanceSummary::default()
            };
        }

        let wins = deltas.iter().filter(|d| **d > 0.0).count();
        let gross_profit: f64 = deltas.iter().filter(|d| **d > 0.0).sum();
        let gross_loss: f64 = deltas.iter().filter(|d| **d < 0.0).map(|d| -d).sum();
        let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
        let variance =
            deltas.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / deltas.len() as f64;
        let std_dev = variance.sqrt();

        PerformanceSummary {
            analyzed_cycles: records.len(),
            win_rate: wins as f64 / deltas.len() as f64 * 100.0,
            profit_factor: if gross_loss > 0.0 {
                gross_profit / gross_loss
            } else if gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            },
            sharpe_ratio: if std_dev > 0.0 { mean / std_dev } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cycle: u64, ts_ms: i64, equity: f64) -> CycleRecord {
        CycleRecord {
            cycle_number: cycle,
            timestamp_ms: ts_ms,
            account: AccountSnapshot {
                total_equity: equity,
                ..AccountSnapshot::default()
            },
            success: true,
            ..CycleRecord::default()
        }
    }

    #[tokio::test]
    async fn test_log_and_read_back_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = DecisionJournal::new(tmp.path(), "t1").unwrap();

        for i in 1..=5u64 {
            journal
                .log_cycle(&record(i, 1_700_000_000_000 + i as i64 * 60_000, 100.0))
                .await
                .unwrap();
        }

        let latest = journal.latest_records(3);
        assert_eq!(latest.len(), 3);
        let cycles: Vec<u64> = latest.iter().map(|r| r.cycle_number).collect();
        assert_eq!(cycles, vec![3, 4, 5]);
        assert_eq!(journal.last_cycle_number(), 5);
    }

    #[tokio::test]
    async fn test_records_are_replayable() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = DecisionJournal::new(tmp.path(), "t1").unwrap();

        let mut rec = record(1, 1_700_000_000_000, 100.0);
        rec.system_prompt = "系统".to_string();
        rec.input_prompt = "用户".to_string();
        rec.cot_trace = "思维链".to_string();
        rec.decisions = vec![Decision {
            symbol: "BTCUSDT".to_string(),
            action: "wait".to_string(),
            reasoning: "观望".to_string(),
            ..Decision::default()
        }];
        journal.log_cycle(&rec).await.unwrap();

        let read_back = journal.latest_records(1).remove(0);
        assert_eq!(read_back.system_prompt, "系统");
        assert_eq!(read_back.decisions.len(), 1);
        assert_eq!(read_back.decisions[0].action, "wait");
    }

    #[tokio::test]
    async fn test_performance_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = DecisionJournal::new(tmp.path(), "t1").unwrap();

        // 100 -> 110 -> 99 : 一胜一负
        for (i, equity) in [100.0, 110.0, 99.0].iter().enumerate() {
            journal
                .log_cycle(&record(
                    i as u64 + 1,
                    1_700_000_000_000 + i as i64 * 60_000,
                    *equity,
                ))
                .await
                .unwrap();
        }

        let perf = journal.analyze_performance(10);
        assert_eq!(perf.analyzed_cycles, 3);
        assert!((perf.win_rate - 50.0).abs() < 1e-9);
        assert!(perf.profit_factor > 0.0);
    }

    #[tokio::test]
    async fn test_empty_journal() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = DecisionJournal::new(tmp.path(), "t1").unwrap();
        assert_eq!(journal.last_cycle_number(), 0);
        assert!(journal.latest_records(5).is_empty());
        assert_eq!(journal.analyze_performance(10).analyzed_cycles, 0);
    }
}
