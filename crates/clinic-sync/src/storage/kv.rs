//! 基于 sled 的持久化本地存储
//!
//! Tree 布局：
//! - `cache:{table}`：缓存表，key 为记录主键
//! - `pending_queue`：待同步队列，key 为大端序 seq，迭代顺序即入队顺序
//! - `pending_index`：op_id -> seq
//! - `dead_letter`：死信区，key 同样为 seq
//! - `meta`：元数据（如 last_synced_at）

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info};

use super::{CachedRecord, LocalStore, PendingOperation};
use crate::error::{ClinicSyncError, Result};

const QUEUE_TREE: &str = "pending_queue";
const QUEUE_INDEX_TREE: &str = "pending_index";
const DEAD_LETTER_TREE: &str = "dead_letter";
const META_TREE: &str = "meta";

type TxResult = std::result::Result<(), ConflictableTransactionError<()>>;

#[derive(Debug, Clone)]
pub struct KvLocalStore {
    base_path: PathBuf,
    db: Arc<Db>,
    queue: Tree,
    queue_index: Tree,
    dead_letter: Tree,
    meta: Tree,
}

impl KvLocalStore {
    /// 打开（或创建）`{data_dir}/kv` 下的 sled 数据库
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let base_path = data_dir.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| ClinicSyncError::Storage(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        debug!("sled 数据库被占用，{}ms 后重试", delay_ms);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            ClinicSyncError::Storage(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let queue = db.open_tree(QUEUE_TREE)?;
        let queue_index = db.open_tree(QUEUE_INDEX_TREE)?;
        let dead_letter = db.open_tree(DEAD_LETTER_TREE)?;
        let meta = db.open_tree(META_TREE)?;

        info!("本地 KV 存储已打开: {:?} (待同步 {} 条)", kv_path, queue.len());

        Ok(Self {
            base_path,
            db: Arc::new(db),
            queue,
            queue_index,
            dead_letter,
            meta,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn cache_tree(&self, table: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("cache:{}", table))?)
    }

    fn decode_ops(tree: &Tree) -> Result<Vec<PendingOperation>> {
        tree.iter()
            .values()
            .map(|value| -> Result<PendingOperation> {
                let bytes = value?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    fn seq_of(&self, op_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.queue_index.get(op_id.as_bytes())?.map(|v| v.to_vec()))
    }
}

fn tx_error(context: &str, error: TransactionError<()>) -> ClinicSyncError {
    ClinicSyncError::Storage(format!("{}: {:?}", context, error))
}

#[async_trait]
impl LocalStore for KvLocalStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<CachedRecord>> {
        let tree = self.cache_tree(table)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, table: &str, record: CachedRecord) -> Result<()> {
        let tree = self.cache_tree(table)?;
        let bytes = serde_json::to_vec(&record)?;
        tree.insert(record.key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.cache_tree(table)?.clear()?;
        Ok(())
    }

    async fn list(&self, table: &str) -> Result<Vec<CachedRecord>> {
        let tree = self.cache_tree(table)?;
        tree.iter()
            .values()
            .map(|value| -> Result<CachedRecord> {
                let bytes = value?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    async fn get_queue(&self) -> Result<Vec<PendingOperation>> {
        Self::decode_ops(&self.queue)
    }

    async fn enqueue(&self, mut op: PendingOperation) -> Result<PendingOperation> {
        op.validate()?;
        // generate_id 跨重启单调递增
        op.seq = self.db.generate_id()? + 1;
        let seq_key = op.seq.to_be_bytes().to_vec();
        let bytes = serde_json::to_vec(&op)?;

        (&self.queue, &self.queue_index)
            .transaction(|(queue, index)| -> TxResult {
                queue.insert(seq_key.clone(), bytes.clone())?;
                index.insert(op.op_id.as_bytes(), seq_key.clone())?;
                Ok(())
            })
            .map_err(|e| tx_error("写入待同步队列失败", e))?;

        debug!("操作已入队: {} (seq={})", op.describe(), op.seq);
        Ok(op)
    }

    async fn dequeue(&self, op_id: &str) -> Result<()> {
        let Some(seq_key) = self.seq_of(op_id)? else {
            return Ok(());
        };
        (&self.queue, &self.queue_index)
            .transaction(|(queue, index)| -> TxResult {
                queue.remove(seq_key.clone())?;
                index.remove(op_id.as_bytes())?;
                Ok(())
            })
            .map_err(|e| tx_error("移除待同步操作失败", e))?;
        Ok(())
    }

    async fn update_op(&self, op: &PendingOperation) -> Result<()> {
        let Some(seq_key) = self.seq_of(&op.op_id)? else {
            return Err(ClinicSyncError::Storage(format!(
                "待同步操作不存在: {}",
                op.op_id
            )));
        };
        let bytes = serde_json::to_vec(op)?;
        self.queue.insert(seq_key, bytes)?;
        Ok(())
    }

    async fn dead_letter(&self, op: &PendingOperation) -> Result<()> {
        let seq_key = match self.seq_of(&op.op_id)? {
            Some(seq_key) => seq_key,
            None => op.seq.to_be_bytes().to_vec(),
        };
        let bytes = serde_json::to_vec(op)?;
        (&self.queue, &self.queue_index, &self.dead_letter)
            .transaction(|(queue, index, dead)| -> TxResult {
                queue.remove(seq_key.clone())?;
                index.remove(op.op_id.as_bytes())?;
                dead.insert(seq_key.clone(), bytes.clone())?;
                Ok(())
            })
            .map_err(|e| tx_error("移入死信区失败", e))?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<PendingOperation>> {
        Self::decode_ops(&self.dead_letter)
    }

    async fn purge_dead_letters(&self) -> Result<usize> {
        let count = self.dead_letter.len();
        self.dead_letter.clear()?;
        Ok(count)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .meta
            .get(key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.meta.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_store() -> (KvLocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = KvLocalStore::open(temp_dir.path()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_then_get_returns_latest() {
        let (store, _temp_dir) = create_test_store().await;

        store
            .put("patients", CachedRecord::new("patients", "P1", json!({"name": "Ana"})))
            .await
            .unwrap();
        store
            .put("patients", CachedRecord::new("patients", "P1", json!({"name": "Ana Lima"})))
            .await
            .unwrap();

        let record = store.get("patients", "P1").await.unwrap().unwrap();
        assert_eq!(record.fields["name"], "Ana Lima");
        assert!(store.get("patients", "P9").await.unwrap().is_none());
        assert!(store.get("invoices", "P1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_table() {
        let (store, _temp_dir) = create_test_store().await;
        store
            .put("patients", CachedRecord::new("patients", "OLD", json!({})))
            .await
            .unwrap();

        let fresh = vec![
            CachedRecord::new("patients", "P1", json!({"id": "P1"})),
            CachedRecord::new("patients", "P2", json!({"id": "P2"})),
        ];
        store.replace_table("patients", fresh).await.unwrap();

        let keys: Vec<String> = store
            .list("patients")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["P1".to_string(), "P2".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_order_and_dequeue() {
        let (store, _temp_dir) = create_test_store().await;

        let a = store
            .enqueue(PendingOperation::create("patients", json!({"id": "P1"})))
            .await
            .unwrap();
        let b = store
            .enqueue(PendingOperation::update("patients", "P2", json!({"name": "Bo"})))
            .await
            .unwrap();
        let c = store
            .enqueue(PendingOperation::delete("patients", "P3"))
            .await
            .unwrap();
        assert!(a.seq < b.seq && b.seq < c.seq);

        store.dequeue(&b.op_id).await.unwrap();
        let ids: Vec<String> = store
            .get_queue()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.op_id)
            .collect();
        assert_eq!(ids, vec![a.op_id.clone(), c.op_id.clone()]);

        // 重复删除不报错
        store.dequeue(&b.op_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_op_keeps_position() {
        let (store, _temp_dir) = create_test_store().await;
        let mut first = store
            .enqueue(PendingOperation::update("patients", "P2", json!({})))
            .await
            .unwrap();
        store
            .enqueue(PendingOperation::delete("patients", "P3"))
            .await
            .unwrap();

        first.record_failure("timeout");
        store.update_op(&first).await.unwrap();

        let queue = store.get_queue().await.unwrap();
        assert_eq!(queue[0].op_id, first.op_id);
        assert_eq!(queue[0].retry_count, 1);
        assert_eq!(queue[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_dead_letter_area() {
        let (store, _temp_dir) = create_test_store().await;
        let op = store
            .enqueue(PendingOperation::update("invoices", "I1", json!({"total": 10})))
            .await
            .unwrap();

        store.dead_letter(&op).await.unwrap();
        assert!(store.get_queue().await.unwrap().is_empty());
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);

        assert_eq!(store.purge_dead_letters().await.unwrap(), 1);
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let op_id = {
            let store = KvLocalStore::open(temp_dir.path()).await.unwrap();
            let op = store
                .enqueue(PendingOperation::create("appointments", json!({"id": "A1"})))
                .await
                .unwrap();
            store.set_meta("last_synced_at", "1700000000000").await.unwrap();
            store.flush().await.unwrap();
            op.op_id
        };

        let store = KvLocalStore::open(temp_dir.path()).await.unwrap();
        let queue = store.get_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op_id, op_id);
        assert_eq!(
            store.get_meta("last_synced_at").await.unwrap().as_deref(),
            Some("1700000000000")
        );

        let next = store
            .enqueue(PendingOperation::delete("appointments", "A2"))
            .await
            .unwrap();
        assert!(next.seq > queue[0].seq);
    }
}
