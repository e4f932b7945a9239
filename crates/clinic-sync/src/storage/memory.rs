//! 进程内本地存储
//!
//! 持久化存储不可用时的降级实现：缓存和队列只在当前会话内有效。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CachedRecord, LocalStore, PendingOperation};
use crate::error::{ClinicSyncError, Result};

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    tables: RwLock<HashMap<String, BTreeMap<String, CachedRecord>>>,
    /// seq -> 操作
    queue: RwLock<BTreeMap<u64, PendingOperation>>,
    dead_letter: RwLock<BTreeMap<u64, PendingOperation>>,
    meta: RwLock<HashMap<String, String>>,
    next_seq: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可用（配额耗尽等），之后所有操作返回存储错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClinicSyncError::Storage("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<CachedRecord>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: &str, record: CachedRecord) -> Result<()> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.ensure_available()?;
        self.tables.write().await.remove(table);
        Ok(())
    }

    async fn list(&self, table: &str) -> Result<Vec<CachedRecord>> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_queue(&self) -> Result<Vec<PendingOperation>> {
        self.ensure_available()?;
        Ok(self.queue.read().await.values().cloned().collect())
    }

    async fn enqueue(&self, mut op: PendingOperation) -> Result<PendingOperation> {
        self.ensure_available()?;
        op.validate()?;
        op.seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue.write().await.insert(op.seq, op.clone());
        Ok(op)
    }

    async fn dequeue(&self, op_id: &str) -> Result<()> {
        self.ensure_available()?;
        self.queue.write().await.retain(|_, op| op.op_id != op_id);
        Ok(())
    }

    async fn update_op(&self, op: &PendingOperation) -> Result<()> {
        self.ensure_available()?;
        let mut queue = self.queue.write().await;
        match queue.values_mut().find(|queued| queued.op_id == op.op_id) {
            Some(queued) => {
                *queued = op.clone();
                Ok(())
            }
            None => Err(ClinicSyncError::Storage(format!(
                "待同步操作不存在: {}",
                op.op_id
            ))),
        }
    }

    async fn dead_letter(&self, op: &PendingOperation) -> Result<()> {
        self.ensure_available()?;
        self.queue.write().await.retain(|_, queued| queued.op_id != op.op_id);
        self.dead_letter.write().await.insert(op.seq, op.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<PendingOperation>> {
        self.ensure_available()?;
        Ok(self.dead_letter.read().await.values().cloned().collect())
    }

    async fn purge_dead_letters(&self) -> Result<usize> {
        self.ensure_available()?;
        let mut dead_letter = self.dead_letter.write().await;
        let count = dead_letter.len();
        dead_letter.clear();
        Ok(count)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.meta.read().await.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_available()?;
        self.meta
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
