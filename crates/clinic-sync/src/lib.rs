//! clinic-sync - 诊所管理后台的离线写队列与同步协调器
//!
//! 本 SDK 提供：
//! - 💾 本地缓存：服务端表的本地副本（sled 持久化，不可用时降级为内存）
//! - 📥 待同步队列：离线写操作按顺序排队，网络恢复后回放
//! - 🔄 同步协调器：全量表同步 + 队列回放，单飞守卫
//! - 📡 网络状态监控：离线 -> 在线边沿触发自动同步
//! - ⏳ 客户端限流：按身份和类别的固定窗口计数
//! - ⚙️ 事件系统：同步各阶段事件与用户通知
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clinic_sync::{ClinicSync, ClinicSyncConfig, NetworkStatusListener, RemoteConfig};
//!
//! # async fn run(listener: Arc<dyn NetworkStatusListener>) -> clinic_sync::Result<()> {
//! let config = ClinicSyncConfig::builder()
//!     .data_dir("/path/to/data")
//!     .tables(["patients", "appointments", "invoices"])
//!     .remote(RemoteConfig {
//!         base_url: "https://clinic.example.co".to_string(),
//!         api_key: "anon-key".to_string(),
//!         ..RemoteConfig::default()
//!     })
//!     .client_identity("front-desk")
//!     .build();
//!
//! let sdk = ClinicSync::initialize_http(config, listener).await?;
//!
//! // 离线时自动入队，在线时立即提交
//! sdk.create("patients", serde_json::json!({"id": "P1", "name": "Ana"})).await?;
//!
//! // 用户手动同步
//! sdk.force_sync().await?;
//!
//! let patients = sdk.cached("patients").await?;
//! println!("缓存患者数: {}", patients.len());
//!
//! sdk.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod rate_limiter;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use config::{ClinicSyncConfig, ClinicSyncConfigBuilder, EventConfig, RemoteConfig, SyncTableConfig};
pub use error::{ClinicSyncError, Result};
pub use events::{EventFilter, EventManager, EventNotifier, Notification, Notifier, SyncEvent};
pub use network::{NetworkEvent, NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use rate_limiter::{LimitRule, RateLimitDecision, RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use remote::{
    Confirmation, Filter, HttpRemoteStore, Order, RemoteError, RemoteErrorKind, RemoteStore, Row,
};
pub use sdk::{ClinicSync, SubmitOutcome};
pub use storage::queue::{QueueStats, RetryPolicy};
pub use storage::{
    CachedRecord, KvLocalStore, LocalStore, MemoryLocalStore, OperationKind, PendingOperation,
};
pub use sync::{
    ConflictPolicy, SyncOutcome, SyncReconciler, SyncReport, SyncState, TableSyncResult,
    TableSyncStatus,
};
pub use utils::init_tracing;
pub use version::SDK_VERSION;
