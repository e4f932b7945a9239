//! 事件系统模块 - 同步子系统对外的观测面
//!
//! 功能包括：
//! - 网络状态变化 / 网络恢复事件
//! - 同步周期各阶段事件（表替换、操作回放、死信）
//! - 限流与无网络事件
//! - 面向用户的通知（`Notifier`）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::network::NetworkStatus;
use crate::utils::time::now_millis;

/// 面向用户的同步通知（手动同步时展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// 同步进行中
    InProgress,
    /// 同步成功
    Success,
    /// 同步失败及原因
    Failure { reason: String },
}

/// 同步子系统事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    NetworkStatusChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: i64,
    },
    /// 离线 -> 在线
    NetworkRestored { timestamp: i64 },
    SyncStarted { pending_operations: usize, timestamp: i64 },
    /// 已有同步在进行，本次触发被忽略
    SyncSkipped { timestamp: i64 },
    TableSynced { table: String, rows: usize, timestamp: i64 },
    TableSyncFailed { table: String, error: String, timestamp: i64 },
    OperationReplayed { op_id: String, table: String, timestamp: i64 },
    OperationFailed {
        op_id: String,
        table: String,
        error: String,
        retry_count: u32,
        timestamp: i64,
    },
    OperationDeadLettered {
        op_id: String,
        table: String,
        error: String,
        timestamp: i64,
    },
    SyncCompleted {
        replayed: usize,
        failed: usize,
        duration_ms: u64,
        timestamp: i64,
    },
    SyncFailed { error: String, timestamp: i64 },
    /// 离线时请求手动同步
    NoConnectivity { timestamp: i64 },
    RateLimited {
        identity: String,
        class: String,
        wait_time_ms: u64,
        timestamp: i64,
    },
    Notification { notification: Notification, timestamp: i64 },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::NetworkStatusChanged { .. } => "network_status_changed",
            SyncEvent::NetworkRestored { .. } => "network_restored",
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncSkipped { .. } => "sync_skipped",
            SyncEvent::TableSynced { .. } => "table_synced",
            SyncEvent::TableSyncFailed { .. } => "table_sync_failed",
            SyncEvent::OperationReplayed { .. } => "operation_replayed",
            SyncEvent::OperationFailed { .. } => "operation_failed",
            SyncEvent::OperationDeadLettered { .. } => "operation_dead_lettered",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::NoConnectivity { .. } => "no_connectivity",
            SyncEvent::RateLimited { .. } => "rate_limited",
            SyncEvent::Notification { .. } => "notification",
        }
    }

    /// 获取事件关联的表名
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncEvent::TableSynced { table, .. }
            | SyncEvent::TableSyncFailed { table, .. }
            | SyncEvent::OperationReplayed { table, .. }
            | SyncEvent::OperationFailed { table, .. }
            | SyncEvent::OperationDeadLettered { table, .. } => Some(table),
            _ => None,
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::NetworkStatusChanged { timestamp, .. }
            | SyncEvent::NetworkRestored { timestamp }
            | SyncEvent::SyncStarted { timestamp, .. }
            | SyncEvent::SyncSkipped { timestamp }
            | SyncEvent::TableSynced { timestamp, .. }
            | SyncEvent::TableSyncFailed { timestamp, .. }
            | SyncEvent::OperationReplayed { timestamp, .. }
            | SyncEvent::OperationFailed { timestamp, .. }
            | SyncEvent::OperationDeadLettered { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. }
            | SyncEvent::NoConnectivity { timestamp }
            | SyncEvent::RateLimited { timestamp, .. }
            | SyncEvent::Notification { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 表名过滤器
    pub tables: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = Some(tables);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref tables) = self.tables {
            match event.table() {
                Some(table) if tables.iter().any(|t| t == table) => {}
                // 事件没有表名但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 失败属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 订阅事件，丢弃接收端即取消订阅
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 用户通知面（由宿主 UI 实现，例如 toast）
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    async fn notify(&self, notification: Notification);
}

/// 默认通知器：转发到事件总线
#[derive(Debug, Clone)]
pub struct EventNotifier {
    events: Arc<EventManager>,
}

impl EventNotifier {
    pub fn new(events: Arc<EventManager>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn notify(&self, notification: Notification) {
        self.events
            .emit(SyncEvent::Notification {
                notification,
                timestamp: now_millis(),
            })
            .await;
    }
}
