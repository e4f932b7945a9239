//! 本地存储模块
//!
//! 持有服务端表的本地缓存副本和待同步操作队列，只做存储，不含策略：
//! - `kv`：基于 sled 的持久化实现
//! - `memory`：进程内实现（降级为仅远端模式时使用，也用于测试）
//! - `queue`：待同步操作与重试策略

pub mod kv;
pub mod memory;
pub mod queue;

pub use kv::KvLocalStore;
pub use memory::MemoryLocalStore;
pub use queue::{OperationKind, PendingOperation};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClinicSyncError, Result};
use crate::remote::Row;
use crate::utils::time::now_millis;

/// 本地缓存的一条记录，身份为 `(table, key)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub table: String,
    pub key: String,
    /// 远端返回的完整字段
    pub fields: Row,
    /// 写入缓存的时间（UTC 毫秒）
    pub synced_at: i64,
}

impl CachedRecord {
    pub fn new(table: impl Into<String>, key: impl Into<String>, fields: Row) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            fields,
            synced_at: now_millis(),
        }
    }

    /// 从远端行构造缓存记录，主键缺失视为错误
    pub fn from_row(table: &str, primary_key: &str, row: Row) -> Result<Self> {
        let key = match row.get(primary_key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => {
                return Err(ClinicSyncError::InvalidArgument(format!(
                    "表 {} 的行缺少主键列 {}",
                    table, primary_key
                )))
            }
            Some(other) => other.to_string(),
        };
        Ok(Self::new(table, key, row))
    }
}

/// 本地存储契约
///
/// 所有操作都可能挂起（磁盘 I/O）。存储不可用或配额不足时返回
/// [`ClinicSyncError::Storage`]，调用方应将其视为非致命错误。
#[async_trait]
pub trait LocalStore: std::fmt::Debug + Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<CachedRecord>>;

    async fn put(&self, table: &str, record: CachedRecord) -> Result<()>;

    async fn clear(&self, table: &str) -> Result<()>;

    /// 读取整张缓存表
    async fn list(&self, table: &str) -> Result<Vec<CachedRecord>>;

    /// 清空后逐条写入；读方可能观察到替换中途的空表或部分表
    async fn replace_table(&self, table: &str, records: Vec<CachedRecord>) -> Result<()> {
        self.clear(table).await?;
        for record in records {
            self.put(table, record).await?;
        }
        Ok(())
    }

    /// 按入队顺序返回待同步操作
    async fn get_queue(&self) -> Result<Vec<PendingOperation>>;

    /// 入队并分配单调递增的 seq
    async fn enqueue(&self, op: PendingOperation) -> Result<PendingOperation>;

    async fn dequeue(&self, op_id: &str) -> Result<()>;

    /// 持久化重试计数和最后一次错误（不改变队列位置）
    async fn update_op(&self, op: &PendingOperation) -> Result<()>;

    /// 从队列移入死信区
    async fn dead_letter(&self, op: &PendingOperation) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<PendingOperation>>;

    /// 清空死信区，返回删除数量
    async fn purge_dead_letters(&self) -> Result<usize>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    /// 数据是否跨会话保留
    fn is_durable(&self) -> bool;
}

/// 打开持久化存储；失败时降级为内存存储（仅远端模式，队列不持久化）
pub async fn open_or_degrade(data_dir: &Path) -> Arc<dyn LocalStore> {
    match KvLocalStore::open(data_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("⚠️ 本地持久化存储不可用，降级为内存存储: {}", e);
            Arc::new(MemoryLocalStore::new())
        }
    }
}
