//! 同步协调器
//!
//! 一次同步周期：
//! 1. 对每张配置的表，从远端拉取完整的权威数据（稳定排序，不做增量）
//! 2. 拉取成功后清空并逐条重建本地缓存
//! 3. 按入队顺序逐个回放待同步操作，成功即出队，失败留在原位并计数
//!
//! 同一时刻最多一个同步周期；重复触发返回 `AlreadyRunning`。

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::conflict::ConflictPolicy;
use super::state::{SyncState, SyncStateHandle};
use super::{
    SyncOutcome, SyncReport, TableSyncResult, TableSyncStatus, LAST_SYNCED_AT_META_KEY,
};
use crate::config::{ClinicSyncConfig, SyncTableConfig};
use crate::error::{ClinicSyncError, Result};
use crate::events::{EventManager, EventNotifier, Notification, Notifier, SyncEvent};
use crate::network::NetworkMonitor;
use crate::remote::{Confirmation, Filter, Order, RemoteError, RemoteErrorKind, RemoteStore};
use crate::storage::queue::{ReplayFailureReason, RetryDecision, RetryPolicy};
use crate::storage::{CachedRecord, LocalStore, OperationKind, PendingOperation};
use crate::utils::time::{format_millis, now_millis};

#[derive(Debug)]
pub struct SyncReconciler {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    notifier: Arc<dyn Notifier>,
    tables: Vec<SyncTableConfig>,
    retry_policy: RetryPolicy,
    conflict_policy: ConflictPolicy,
    state: Arc<SyncStateHandle>,
    last_report: parking_lot::Mutex<Option<SyncReport>>,
}

impl SyncReconciler {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        config: &ClinicSyncConfig,
    ) -> Self {
        let notifier: Arc<dyn Notifier> = Arc::new(EventNotifier::new(events.clone()));
        Self {
            store,
            remote,
            monitor,
            events,
            notifier,
            tables: config.tables.clone(),
            retry_policy: config.retry_policy.clone(),
            conflict_policy: config.conflict_policy,
            state: Arc::new(SyncStateHandle::new()),
            last_report: parking_lot::Mutex::new(None),
        }
    }

    /// 替换用户通知面（默认转发到事件总线）
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn state(&self) -> Arc<SyncStateHandle> {
        self.state.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.state.snapshot()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().clone()
    }

    /// 从元数据恢复上次同步时间
    pub async fn restore_state(&self) {
        match self.store.get_meta(LAST_SYNCED_AT_META_KEY).await {
            Ok(Some(value)) => match value.parse::<i64>() {
                Ok(millis) => {
                    debug!("上次同步时间: {}", format_millis(millis));
                    self.state.set_last_synced_at(millis);
                }
                Err(e) => warn!("last_synced_at 元数据无效 {:?}: {}", value, e),
            },
            Ok(None) => {}
            Err(e) => warn!("读取同步元数据失败: {}", e),
        }
    }

    /// 执行一次完整同步
    ///
    /// 表拉取失败不会中断其他表和队列回放，第一个拉取错误在周期结束、守卫释放后返回。
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        let Some(guard) = self.state.try_begin() else {
            info!("同步已在进行中，忽略本次触发");
            self.events
                .emit(SyncEvent::SyncSkipped {
                    timestamp: now_millis(),
                })
                .await;
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let started = Instant::now();
        let mut report = SyncReport {
            started_at: now_millis(),
            ..SyncReport::default()
        };

        let pending_operations = match self.store.get_queue().await {
            Ok(queue) => queue.len(),
            Err(e) => {
                warn!("读取待同步队列失败: {}", e);
                0
            }
        };
        info!(
            "🔄 开始同步: {} 张表, {} 个待同步操作",
            self.tables.len(),
            pending_operations
        );
        self.events
            .emit(SyncEvent::SyncStarted {
                pending_operations,
                timestamp: report.started_at,
            })
            .await;

        let mut first_fetch_error: Option<ClinicSyncError> = None;
        for table in &self.tables {
            match self.sync_table(table).await {
                Ok(result) => report.tables.push(result),
                Err(e) => {
                    report.tables.push(TableSyncResult {
                        table: table.name.clone(),
                        rows: 0,
                        status: TableSyncStatus::FetchFailed(e.to_string()),
                    });
                    first_fetch_error.get_or_insert(e);
                }
            }
        }

        self.drain_queue(&mut report).await;

        report.finished_at = now_millis();
        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.all_tables_replaced() {
            self.state.set_last_synced_at(report.finished_at);
            if let Err(e) = self
                .store
                .set_meta(LAST_SYNCED_AT_META_KEY, &report.finished_at.to_string())
                .await
            {
                warn!("保存同步时间失败: {}", e);
            }
        }

        *self.last_report.lock() = Some(report.clone());
        drop(guard);

        match first_fetch_error {
            Some(e) => {
                error!("同步完成但有表拉取失败: {}", e);
                self.events
                    .emit(SyncEvent::SyncFailed {
                        error: e.to_string(),
                        timestamp: report.finished_at,
                    })
                    .await;
                Err(e)
            }
            None => {
                info!(
                    "✅ 同步完成: 回放 {} 个, 失败 {} 个, 死信 {} 个, 耗时 {}ms",
                    report.replayed.len(),
                    report.failed.len(),
                    report.dead_lettered.len(),
                    report.duration_ms
                );
                self.events
                    .emit(SyncEvent::SyncCompleted {
                        replayed: report.replayed.len(),
                        failed: report.failed.len(),
                        duration_ms: report.duration_ms,
                        timestamp: report.finished_at,
                    })
                    .await;
                Ok(SyncOutcome::Started(report))
            }
        }
    }

    /// 用户手动触发的同步：离线时直接拒绝，不发起任何远端调用
    #[instrument(skip(self))]
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        if self.monitor.is_offline().await {
            warn!("离线状态，拒绝手动同步");
            self.notifier
                .notify(Notification::Failure {
                    reason: ClinicSyncError::NoConnectivity.to_string(),
                })
                .await;
            self.events
                .emit(SyncEvent::NoConnectivity {
                    timestamp: now_millis(),
                })
                .await;
            return Err(ClinicSyncError::NoConnectivity);
        }

        // 已有同步在进行时不开始新的通知流程
        if self.state.is_syncing() {
            info!("同步已在进行中，忽略手动同步");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        self.notifier.notify(Notification::InProgress).await;
        match self.sync_all().await {
            Ok(SyncOutcome::Started(report)) => {
                self.notifier.notify(Notification::Success).await;
                Ok(SyncOutcome::Started(report))
            }
            Ok(SyncOutcome::AlreadyRunning) => {
                // 检查之后被其他触发抢先，InProgress 已发出，必须给出结束通知
                self.notifier
                    .notify(Notification::Failure {
                        reason: "sync already in progress".to_string(),
                    })
                    .await;
                Ok(SyncOutcome::AlreadyRunning)
            }
            Err(e) => {
                self.notifier
                    .notify(Notification::Failure {
                        reason: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// 立即把一个操作应用到远端（不经过队列）
    pub async fn apply_now(
        &self,
        op: &PendingOperation,
    ) -> std::result::Result<Confirmation, RemoteError> {
        let expected_version = self.conflict_policy.expected_version(op);
        match op.kind {
            OperationKind::Create => self.remote.insert(&op.table, &op.payload).await,
            OperationKind::Update => {
                let key = Self::require_key(op)?;
                self.remote
                    .update(&op.table, key, &op.payload, expected_version)
                    .await
            }
            OperationKind::Delete => {
                let key = Self::require_key(op)?;
                match self.remote.delete(&op.table, key, expected_version).await {
                    // 记录已不存在，删除视为已完成
                    Err(e) if e.kind == RemoteErrorKind::NotFound => {
                        debug!("删除目标已不存在: {}", op.describe());
                        Ok(Confirmation::default())
                    }
                    other => other,
                }
            }
        }
    }

    fn require_key(op: &PendingOperation) -> std::result::Result<&str, RemoteError> {
        op.key.as_deref().ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::Validation,
                format!("{} 缺少记录主键", op.describe()),
            )
        })
    }

    /// 拉取单表并替换本地缓存；只有拉取错误会返回 Err
    async fn sync_table(&self, table: &SyncTableConfig) -> Result<TableSyncResult> {
        let order = Order {
            column: table.order_by.clone(),
            descending: table.descending,
        };
        let rows = match self.remote.select(&table.name, &Filter::new(), &order).await {
            Ok(rows) => rows,
            Err(source) => {
                let err = ClinicSyncError::RemoteFetch {
                    table: table.name.clone(),
                    source,
                };
                warn!("{}，保留旧缓存", err);
                self.events
                    .emit(SyncEvent::TableSyncFailed {
                        table: table.name.clone(),
                        error: err.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                return Err(err);
            }
        };

        let fetched = rows.len();
        let records: Vec<CachedRecord> = rows
            .into_iter()
            .filter_map(|row| match CachedRecord::from_row(&table.name, &table.primary_key, row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("跳过无效行: {}", e);
                    None
                }
            })
            .collect();
        let count = records.len();

        let status = match self.store.replace_table(&table.name, records).await {
            Ok(()) => {
                debug!("表 {} 同步: 拉取 {} 行, 缓存 {} 行", table.name, fetched, count);
                self.events
                    .emit(SyncEvent::TableSynced {
                        table: table.name.clone(),
                        rows: count,
                        timestamp: now_millis(),
                    })
                    .await;
                TableSyncStatus::Replaced
            }
            Err(e) => {
                // 本地存储失败不影响远端权威数据，降级继续
                warn!("替换本地缓存失败 {}: {}", table.name, e);
                self.events
                    .emit(SyncEvent::TableSyncFailed {
                        table: table.name.clone(),
                        error: e.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                TableSyncStatus::StorageFailed(e.to_string())
            }
        };

        Ok(TableSyncResult {
            table: table.name.clone(),
            rows: count,
            status,
        })
    }

    /// 按入队顺序严格串行回放
    async fn drain_queue(&self, report: &mut SyncReport) {
        let queue = match self.store.get_queue().await {
            Ok(queue) => queue,
            Err(e) => {
                warn!("读取待同步队列失败，跳过回放: {}", e);
                return;
            }
        };

        for op in queue {
            match self.apply_now(&op).await {
                Ok(_) => {
                    if let Err(e) = self.store.dequeue(&op.op_id).await {
                        warn!("移除已回放操作失败 {}: {}", op.op_id, e);
                    }
                    debug!("回放成功: {}", op.describe());
                    report.replayed.push(op.op_id.clone());
                    self.events
                        .emit(SyncEvent::OperationReplayed {
                            op_id: op.op_id,
                            table: op.table,
                            timestamp: now_millis(),
                        })
                        .await;
                }
                Err(source) => self.handle_replay_failure(op, source, report).await,
            }
        }
    }

    async fn handle_replay_failure(
        &self,
        mut op: PendingOperation,
        source: RemoteError,
        report: &mut SyncReport,
    ) {
        let reason = ReplayFailureReason::classify(&source, op.kind);
        op.record_failure(source.to_string());
        let err = ClinicSyncError::Replay {
            op_id: op.op_id.clone(),
            source,
        };

        match self.retry_policy.decide(&op, &reason) {
            RetryDecision::Retry => {
                warn!("{} ({}, 第 {} 次)", err, op.describe(), op.retry_count);
                if let Err(e) = self.store.update_op(&op).await {
                    warn!("保存重试计数失败 {}: {}", op.op_id, e);
                }
                report.failed.push(op.op_id.clone());
                self.events
                    .emit(SyncEvent::OperationFailed {
                        op_id: op.op_id,
                        table: op.table,
                        error: err.to_string(),
                        retry_count: op.retry_count,
                        timestamp: now_millis(),
                    })
                    .await;
            }
            RetryDecision::DeadLetter => {
                error!("{} ({})，移入死信区", err, op.describe());
                if let Err(e) = self.store.dead_letter(&op).await {
                    warn!("移入死信区失败 {}: {}", op.op_id, e);
                }
                report.dead_lettered.push(op.op_id.clone());
                self.events
                    .emit(SyncEvent::OperationDeadLettered {
                        op_id: op.op_id,
                        table: op.table,
                        error: err.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
            }
        }
    }
}
