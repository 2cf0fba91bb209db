//! 读穿TTL缓存
//!
//! 余额与持仓的短时缓存槽。读方拿到的是完整快照的克隆，写入与失效
//! 都是整槽替换，不存在半新半旧的视图。

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub struct TtlCache<T> {
    slot: RwLock<Option<(T, Instant)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            ttl,
        }
    }

    /// 未过期时返回缓存值
    pub async fn get(&self) -> Option<T> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some((value, at)) if at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    /// 缓存命中时返回缓存年龄（调试日志用）
    pub async fn age(&self) -> Option<Duration> {
        let slot = self.slot.read().await;
        slot.as_ref().map(|(_, at)| at.elapsed())
    }

    pub async fn set(&self, value: T) {
        *self.slot.write().await = Some((value, Instant::now()));
    }

    /// 变更操作成功后调用
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}
