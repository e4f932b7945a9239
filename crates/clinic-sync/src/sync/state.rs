use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// 同步状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub is_syncing: bool,
    /// 最近一次所有表都替换成功的时间（UTC 毫秒）
    pub last_synced_at: Option<i64>,
}

/// 同步状态句柄，由协调器持有，可通过 `Arc` 共享
///
/// `is_syncing` 在第一个挂起点之前通过 compare-exchange 置位，
/// 由 [`SyncGuard`] 在所有退出路径上清除。
#[derive(Debug, Default)]
pub struct SyncStateHandle {
    is_syncing: AtomicBool,
    /// 0 表示从未同步
    last_synced_at: AtomicI64,
}

impl SyncStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试开始同步；已在同步中返回 None
    pub fn try_begin(self: &Arc<Self>) -> Option<SyncGuard> {
        self.is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                state: Arc::clone(self),
            })
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub fn last_synced_at(&self) -> Option<i64> {
        match self.last_synced_at.load(Ordering::Acquire) {
            0 => None,
            millis => Some(millis),
        }
    }

    pub fn set_last_synced_at(&self, millis: i64) {
        self.last_synced_at.store(millis, Ordering::Release);
    }

    pub fn snapshot(&self) -> SyncState {
        SyncState {
            is_syncing: self.is_syncing(),
            last_synced_at: self.last_synced_at(),
        }
    }
}

/// 同步进行中的 RAII 守卫
#[derive(Debug)]
pub struct SyncGuard {
    state: Arc<SyncStateHandle>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.state.is_syncing.store(false, Ordering::Release);
    }
}
