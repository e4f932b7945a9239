//! SDK 主入口
//!
//! `ClinicSync` 把本地存储、网络监控、同步协调器、限流器和事件总线组装在一起，
//! 供应用层调用。

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ClinicSyncConfig;
use crate::error::{ClinicSyncError, Result};
use crate::events::{EventManager, EventStats, FilteredEventReceiver, EventFilter, Notifier, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
use crate::rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterStats};
use crate::remote::{Confirmation, HttpRemoteStore, RemoteStore, Row};
use crate::storage::queue::{QueueStats, ReplayFailureReason};
use crate::storage::{open_or_degrade, CachedRecord, LocalStore, PendingOperation};
use crate::sync::{AutoSyncHandle, SyncOutcome, SyncReconciler, SyncReport, SyncState};
use crate::utils::time::now_millis;
use crate::version::SDK_VERSION;

/// 写操作提交结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 已被远端确认
    Applied(Confirmation),
    /// 已进入待同步队列
    Queued(String),
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued(_))
    }
}

#[derive(Debug)]
pub struct ClinicSync {
    config: ClinicSyncConfig,
    store: Arc<dyn LocalStore>,
    monitor: Arc<NetworkMonitor>,
    reconciler: Arc<SyncReconciler>,
    rate_limiter: Arc<RateLimiter>,
    events: Arc<EventManager>,
    auto_sync: parking_lot::Mutex<Option<AutoSyncHandle>>,
}

impl ClinicSync {
    /// 打开持久化存储（失败时降级为内存存储），启动网络监控和自动同步
    pub async fn initialize(
        config: ClinicSyncConfig,
        remote: Arc<dyn RemoteStore>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Self> {
        config.validate()?;
        let store = open_or_degrade(&config.data_dir).await;
        Self::with_store(config, store, remote, listener, None).await
    }

    /// 使用内置的 HTTP 远端实现
    pub async fn initialize_http(
        config: ClinicSyncConfig,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Self> {
        if config.remote.base_url.is_empty() {
            return Err(ClinicSyncError::Config("remote.base_url 不能为空".to_string()));
        }
        let remote = Arc::new(HttpRemoteStore::new(&config.remote)?.with_tables(&config.tables));
        Self::initialize(config, remote, listener).await
    }

    /// 使用指定的本地存储和通知面
    pub async fn with_store(
        config: ClinicSyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        listener: Arc<dyn NetworkStatusListener>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        config.validate()?;
        info!("🚀 clinic-sync {} 初始化", SDK_VERSION);
        if !store.is_durable() {
            warn!("⚠️ 当前为仅远端模式，待同步队列不会跨会话保留");
        }

        let events = Arc::new(EventManager::new(config.event_config.buffer_size));
        let monitor = Arc::new(NetworkMonitor::new(listener));
        monitor.start().await?;

        let mut reconciler = SyncReconciler::new(
            store.clone(),
            remote,
            monitor.clone(),
            events.clone(),
            &config,
        );
        if let Some(notifier) = notifier {
            reconciler = reconciler.with_notifier(notifier);
        }
        let reconciler = Arc::new(reconciler);
        reconciler.restore_state().await;

        let auto_sync = AutoSyncHandle::spawn(
            reconciler.clone(),
            &monitor,
            events.clone(),
            config.auto_sync,
        );
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));

        info!(
            "✅ clinic-sync 初始化完成: {} 张同步表, 网络状态 {:?}",
            config.tables.len(),
            monitor.get_status().await
        );

        Ok(Self {
            config,
            store,
            monitor,
            reconciler,
            rate_limiter,
            events,
            auto_sync: parking_lot::Mutex::new(Some(auto_sync)),
        })
    }

    pub fn config(&self) -> &ClinicSyncConfig {
        &self.config
    }

    /// 提交写操作
    ///
    /// 在线且队列为空时立即提交（`write` 类别限流）；离线、队列中仍有待回放操作
    /// 或遇到可重试错误时进入待同步队列，保证按提交顺序到达远端。
    /// 不可重试的远端错误直接返回给调用方。
    pub async fn submit(&self, op: PendingOperation) -> Result<SubmitOutcome> {
        op.validate()?;
        self.check_rate_limit("write").await?;

        if !self.monitor.is_offline().await && self.queue_is_empty().await {
            match self.reconciler.apply_now(&op).await {
                Ok(confirmation) => return Ok(SubmitOutcome::Applied(confirmation)),
                Err(e) => {
                    let reason = ReplayFailureReason::classify(&e, op.kind);
                    if !reason.is_retryable() {
                        return Err(ClinicSyncError::Remote(e));
                    }
                    warn!("即时提交失败，转入待同步队列: {} ({})", op.describe(), e);
                }
            }
        }

        let queued = self.store.enqueue(op).await?;
        info!("📥 操作已入队: {}", queued.describe());
        Ok(SubmitOutcome::Queued(queued.op_id))
    }

    /// 队列读取失败时按空队列处理，直接提交
    async fn queue_is_empty(&self) -> bool {
        match self.store.get_queue().await {
            Ok(queue) if queue.is_empty() => true,
            Ok(queue) => {
                debug!("队列中还有 {} 个待回放操作，新操作排在其后", queue.len());
                false
            }
            Err(e) => {
                warn!("读取待同步队列失败: {}", e);
                true
            }
        }
    }

    pub async fn create(&self, table: &str, payload: Row) -> Result<SubmitOutcome> {
        let primary_key = self.config.primary_key_for(table);
        self.submit(PendingOperation::create_keyed(table, primary_key, payload))
            .await
    }

    pub async fn update(&self, table: &str, key: &str, payload: Row) -> Result<SubmitOutcome> {
        self.submit(PendingOperation::update(table, key, payload)).await
    }

    pub async fn delete(&self, table: &str, key: &str) -> Result<SubmitOutcome> {
        self.submit(PendingOperation::delete(table, key)).await
    }

    /// 读取本地缓存表
    pub async fn cached(&self, table: &str) -> Result<Vec<CachedRecord>> {
        self.store.list(table).await
    }

    pub async fn cached_record(&self, table: &str, key: &str) -> Result<Option<CachedRecord>> {
        self.store.get(table, key).await
    }

    /// 立即同步（网络状态不做检查）
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.reconciler.sync_all().await
    }

    /// 用户手动同步，离线时返回 `NoConnectivity`
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        self.reconciler.force_sync().await
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.store.get_queue().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<PendingOperation>> {
        self.store.dead_letters().await
    }

    pub async fn purge_dead_letters(&self) -> Result<usize> {
        self.store.purge_dead_letters().await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let queue = self.store.get_queue().await?;
        let dead_letters = self.store.dead_letters().await?;
        Ok(QueueStats::from_ops(&queue, &dead_letters))
    }

    pub async fn network_status(&self) -> NetworkStatus {
        self.monitor.get_status().await
    }

    pub async fn is_online(&self) -> bool {
        self.monitor.is_online().await
    }

    /// 宿主直接推送网络状态
    pub async fn set_network_status(&self, status: NetworkStatus) {
        self.monitor.set_status(status).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub async fn event_stats(&self) -> EventStats {
        self.events.get_stats().await
    }

    pub fn sync_state(&self) -> SyncState {
        self.reconciler.sync_state()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.reconciler.last_report()
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    /// 以当前客户端身份检查限流
    pub async fn check_rate_limit(&self, class: &str) -> Result<RateLimitDecision> {
        let identity = self.config.client_identity.clone();
        self.check_rate_limit_for(&identity, class).await
    }

    /// 检查限流，失败时发布 `RateLimited` 事件并返回 `RateLimitExceeded`
    pub async fn check_rate_limit_for(
        &self,
        identity: &str,
        class: &str,
    ) -> Result<RateLimitDecision> {
        match self.rate_limiter.check(identity, class) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                if let Some(wait_time_ms) = e.wait_time_ms() {
                    warn!("⏳ 限流: identity={}, class={}, 等待 {}ms", identity, class, wait_time_ms);
                    self.events
                        .emit(SyncEvent::RateLimited {
                            identity: identity.to_string(),
                            class: class.to_string(),
                            wait_time_ms,
                            timestamp: now_millis(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.rate_limiter.stats()
    }

    /// 停止自动同步（取消订阅）、停止网络监控并刷盘
    pub async fn shutdown(&self) -> Result<()> {
        let auto_sync = self.auto_sync.lock().take();
        if let Some(handle) = auto_sync {
            handle.stop().await;
        }
        self.monitor.stop().await;
        self.rate_limiter.purge_expired();
        self.store.flush().await?;
        info!("clinic-sync 已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncTableConfig;
    use crate::network::DummyNetworkStatusListener;
    use crate::rate_limiter::{LimitRule, RateLimiterConfig};
    use crate::remote::test_helpers::MockRemoteStore;
    use crate::remote::{RemoteError, RemoteErrorKind};
    use crate::storage::{MemoryLocalStore, OperationKind};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> ClinicSyncConfig {
        ClinicSyncConfig::builder()
            .tables(["patients"])
            .client_identity("front-desk")
            .build()
    }

    async fn sdk_with(
        status: NetworkStatus,
        remote: Arc<MockRemoteStore>,
        config: ClinicSyncConfig,
    ) -> (ClinicSync, Arc<DummyNetworkStatusListener>) {
        let listener = Arc::new(DummyNetworkStatusListener::new(status));
        let sdk = ClinicSync::with_store(
            config,
            Arc::new(MemoryLocalStore::new()),
            remote,
            listener.clone(),
            None,
        )
        .await
        .unwrap();
        (sdk, listener)
    }

    async fn wait_for(rx: &mut broadcast::Receiver<SyncEvent>, event_type: &str) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.event_type() == event_type {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_offline_queue_replayed_on_restore() {
        let remote = Arc::new(MockRemoteStore::new().with_table(
            "patients",
            vec![json!({"id": "P3", "name": "Caio"})],
        ));
        let (sdk, listener) = sdk_with(NetworkStatus::Offline, remote.clone(), config()).await;
        let mut rx = sdk.subscribe();

        assert!(sdk
            .create("patients", json!({"id": "P1", "name": "Ana"}))
            .await
            .unwrap()
            .is_queued());
        assert!(sdk
            .update("patients", "P2", json!({"name": "Bo"}))
            .await
            .unwrap()
            .is_queued());
        assert!(sdk.delete("patients", "P3").await.unwrap().is_queued());
        assert_eq!(remote.total_calls(), 0);
        assert_eq!(sdk.pending_operations().await.unwrap().len(), 3);

        listener.push(NetworkStatus::Online).await;
        wait_for(&mut rx, "sync_completed").await;

        // P2 在远端不存在，更新失败但保留在队列中
        let queue = sdk.pending_operations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, OperationKind::Update);
        assert_eq!(queue[0].key.as_deref(), Some("P2"));
        assert_eq!(queue[0].retry_count, 1);

        assert_eq!(
            remote.applied(),
            vec![
                "create:patients:P1".to_string(),
                "delete:patients:P3".to_string()
            ]
        );
        // 缓存来自回放之前的全量拉取
        assert!(sdk.cached_record("patients", "P3").await.unwrap().is_some());
        assert!(sdk.sync_state().last_synced_at.is_some());

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_online_submit_applies_immediately() {
        let remote = Arc::new(MockRemoteStore::new());
        let (sdk, _listener) = sdk_with(NetworkStatus::Online, remote.clone(), config()).await;

        let outcome = sdk
            .create("patients", json!({"id": "P1", "name": "Ana"}))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Applied(_)));
        assert!(sdk.pending_operations().await.unwrap().is_empty());
        assert_eq!(remote.rows("patients").len(), 1);
    }

    #[tokio::test]
    async fn test_online_submit_waits_behind_queued_ops() {
        let remote = Arc::new(MockRemoteStore::new().with_table(
            "patients",
            vec![json!({"id": "P2", "name": "Bo"})],
        ));
        let config = ClinicSyncConfig::builder()
            .tables(["patients"])
            .auto_sync(false)
            .build();
        let (sdk, _listener) = sdk_with(NetworkStatus::Offline, remote.clone(), config).await;

        let older = sdk
            .update("patients", "P2", json!({"name": "older"}))
            .await
            .unwrap();
        assert!(older.is_queued());

        sdk.set_network_status(NetworkStatus::Online).await;
        let newer = sdk
            .update("patients", "P2", json!({"name": "newer"}))
            .await
            .unwrap();
        assert!(newer.is_queued());
        assert_eq!(remote.mutation_calls(), 0);

        sdk.sync_now().await.unwrap();
        assert!(sdk.pending_operations().await.unwrap().is_empty());
        assert_eq!(remote.rows("patients")[0]["name"], "newer");
        assert_eq!(
            remote.applied(),
            vec![
                "update:patients:P2".to_string(),
                "update:patients:P2".to_string()
            ]
        );

        // 队列清空后恢复即时提交
        let next = sdk
            .update("patients", "P2", json!({"name": "latest"}))
            .await
            .unwrap();
        assert!(matches!(next, SubmitOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn test_create_uses_table_primary_key() {
        let remote = Arc::new(MockRemoteStore::new());
        let config = ClinicSyncConfig::builder()
            .tables(["patients"])
            .add_table(SyncTableConfig {
                primary_key: "invoice_no".to_string(),
                ..SyncTableConfig::new("invoices")
            })
            .build();
        let (sdk, _listener) = sdk_with(NetworkStatus::Offline, remote, config).await;

        sdk.create("invoices", json!({"invoice_no": "INV-7", "total": 120}))
            .await
            .unwrap();
        let queue = sdk.pending_operations().await.unwrap();
        assert_eq!(queue[0].key.as_deref(), Some("INV-7"));
    }

    #[tokio::test]
    async fn test_retryable_failure_is_queued() {
        let remote = Arc::new(MockRemoteStore::new());
        remote.fail_mutation("P1", RemoteError::new(RemoteErrorKind::Server(502), "bad gateway"));
        let (sdk, _listener) = sdk_with(NetworkStatus::Online, remote, config()).await;

        let outcome = sdk.create("patients", json!({"id": "P1"})).await.unwrap();
        assert!(outcome.is_queued());
        assert_eq!(sdk.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_returned() {
        let remote = Arc::new(MockRemoteStore::new());
        remote.fail_mutation(
            "P1",
            RemoteError::new(RemoteErrorKind::Validation, "name is required"),
        );
        let (sdk, _listener) = sdk_with(NetworkStatus::Online, remote, config()).await;

        let err = sdk.create("patients", json!({"id": "P1"})).await.unwrap_err();
        assert!(matches!(err, ClinicSyncError::Remote(_)));
        assert!(sdk.pending_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_rate_limit() {
        let limits = RateLimiterConfig::default().with_class(
            "write",
            LimitRule {
                max_requests: 2,
                window_ms: 60_000,
            },
        );
        let config = ClinicSyncConfig::builder()
            .tables(["patients"])
            .rate_limiter(limits)
            .build();
        let remote = Arc::new(MockRemoteStore::new());
        let (sdk, _listener) = sdk_with(NetworkStatus::Offline, remote, config).await;
        let mut rx = sdk.subscribe();

        sdk.delete("patients", "P1").await.unwrap();
        sdk.delete("patients", "P2").await.unwrap();
        let err = sdk.delete("patients", "P3").await.unwrap_err();
        assert!(matches!(err, ClinicSyncError::RateLimitExceeded { .. }));
        assert_eq!(sdk.pending_operations().await.unwrap().len(), 2);

        match wait_for(&mut rx, "rate_limited").await {
            SyncEvent::RateLimited { class, wait_time_ms, .. } => {
                assert_eq!(class, "write");
                assert!(wait_time_ms > 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(sdk.rate_limiter_stats().blocked, 1);
    }

    #[tokio::test]
    async fn test_force_sync_offline() {
        let remote = Arc::new(MockRemoteStore::new());
        let (sdk, _listener) = sdk_with(NetworkStatus::Offline, remote.clone(), config()).await;

        let err = sdk.force_sync().await.unwrap_err();
        assert!(matches!(err, ClinicSyncError::NoConnectivity));
        assert_eq!(remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_initialize_degrades_to_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let config = ClinicSyncConfig::builder()
            .data_dir(&blocker)
            .tables(["patients"])
            .build();
        let listener = Arc::new(DummyNetworkStatusListener::new(NetworkStatus::Offline));
        let sdk = ClinicSync::initialize(config, Arc::new(MockRemoteStore::new()), listener)
            .await
            .unwrap();

        assert!(!sdk.is_durable());
        assert!(sdk.delete("patients", "P1").await.unwrap().is_queued());
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_queue_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ClinicSyncConfig::builder()
            .data_dir(tmp.path())
            .tables(["patients"])
            .build();

        {
            let listener = Arc::new(DummyNetworkStatusListener::new(NetworkStatus::Offline));
            let sdk = ClinicSync::initialize(
                config.clone(),
                Arc::new(MockRemoteStore::new()),
                listener,
            )
            .await
            .unwrap();
            assert!(sdk.is_durable());
            sdk.update("patients", "P2", json!({"name": "Bo"})).await.unwrap();
            sdk.shutdown().await.unwrap();
        }

        let listener = Arc::new(DummyNetworkStatusListener::new(NetworkStatus::Offline));
        let sdk = ClinicSync::initialize(config, Arc::new(MockRemoteStore::new()), listener)
            .await
            .unwrap();
        let queue = sdk.pending_operations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].key.as_deref(), Some("P2"));
    }

    #[tokio::test]
    async fn test_initialize_http_requires_base_url() {
        let listener = Arc::new(DummyNetworkStatusListener::default());
        let err = ClinicSync::initialize_http(ClinicSyncConfig::default(), listener)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicSyncError::Config(_)));
    }
}
