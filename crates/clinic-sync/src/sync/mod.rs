//! 同步模块
//!
//! - `reconciler`：全量表同步 + 待同步队列回放
//! - `auto_sync`：网络恢复时自动触发同步
//! - `state`：单飞同步守卫
//! - `conflict`：回放冲突策略

pub mod auto_sync;
pub mod conflict;
pub mod reconciler;
pub mod state;

pub use auto_sync::AutoSyncHandle;
pub use conflict::ConflictPolicy;
pub use reconciler::SyncReconciler;
pub use state::{SyncGuard, SyncState, SyncStateHandle};

/// 元数据中保存最近同步时间的键
pub const LAST_SYNCED_AT_META_KEY: &str = "last_synced_at";

/// 一次同步请求的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// 本次调用执行了同步
    Started(SyncReport),
    /// 已有同步在进行，本次未执行任何拉取或回放
    AlreadyRunning,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Started(report) => Some(report),
            SyncOutcome::AlreadyRunning => None,
        }
    }
}

/// 单表同步状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSyncStatus {
    /// 拉取成功并替换了本地缓存
    Replaced,
    /// 拉取失败，缓存保持旧数据
    FetchFailed(String),
    /// 拉取成功但写入本地失败（远端数据仍为权威）
    StorageFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSyncResult {
    pub table: String,
    pub rows: usize,
    pub status: TableSyncStatus,
}

/// 同步报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub tables: Vec<TableSyncResult>,
    /// 回放成功并移出队列的操作
    pub replayed: Vec<String>,
    /// 回放失败、仍留在队列中的操作
    pub failed: Vec<String>,
    /// 移入死信区的操作
    pub dead_lettered: Vec<String>,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: u64,
}

impl SyncReport {
    /// 所有表都替换成功
    pub fn all_tables_replaced(&self) -> bool {
        self.tables
            .iter()
            .all(|t| t.status == TableSyncStatus::Replaced)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableSyncStatus::FetchFailed(_)))
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.all_tables_replaced() && self.failed.is_empty() && self.dead_lettered.is_empty()
    }
}
