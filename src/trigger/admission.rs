//! 触发准入: 防抖与限流
//!
//! 两者的状态都按 key 分片保存在 `DashMap` 中,只在单个 key 的 entry 锁内修改。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// 按 (规则, 资产) 的窗口防抖
///
/// 窗口内的第一个触发开启窗口并持有唯一的计时;后续触发只替换待执行槽位,
/// 立即返回。窗口结束时执行槽位中最新的触发,因此持续输入下每个窗口
/// 至少执行一次,每个 key 同时最多一个待执行触发。
pub struct Debouncer<T> {
    pending: DashMap<(Uuid, String), T>,
}

impl<T> Debouncer<T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// 提交一个触发
    ///
    /// 返回 `Some` 表示窗口结束,调用方负责执行返回的最新触发;
    /// 返回 `None` 表示已并入当前窗口。
    pub async fn admit(&self, rule_id: Uuid, asset_key: &str, window: Duration, item: T) -> Option<T> {
        if window.is_zero() {
            return Some(item);
        }

        let key = (rule_id, asset_key.to_string());
        match self.pending.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(item);
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }

        sleep(window).await;
        self.pending.remove(&key).map(|(_, latest)| latest)
    }

    /// 窗口尚未结束的 (规则, 资产) 数量
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for Debouncer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// 按规则的滑动窗口限流
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    admitted: DashMap<Uuid, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            admitted: DashMap::new(),
        }
    }

    /// 窗口内未达上限时记录一次并返回 true;`max == 0` 表示不限流
    pub fn try_acquire(&self, rule_id: Uuid, max: u32) -> bool {
        if max == 0 {
            return true;
        }

        let now = Instant::now();
        let mut admitted = self.admitted.entry(rule_id).or_default();
        while admitted
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            admitted.pop_front();
        }

        if admitted.len() < max as usize {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }
}
