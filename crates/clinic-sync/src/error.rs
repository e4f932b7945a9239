use crate::remote::{RemoteError, RemoteErrorKind};
use thiserror::Error;

/// SDK 统一错误类型
///
/// 存储错误和拉取错误在协调器边界被记录并降级处理；
/// 限流错误与无网络错误总是同步返回给直接调用方。
#[derive(Debug, Error)]
pub enum ClinicSyncError {
    /// 本地存储不可用、写入被拒绝或配额不足（非致命，可降级为仅远端模式）
    #[error("Storage error: {0}")]
    Storage(String),

    /// 同步过程中某张表拉取失败（该表缓存保持旧数据）
    #[error("Remote fetch failed for table {table}: {source}")]
    RemoteFetch {
        table: String,
        #[source]
        source: RemoteError,
    },

    /// 待同步操作回放失败（操作仍留在队列中）
    #[error("Replay failed for operation {op_id}: {source}")]
    Replay {
        op_id: String,
        #[source]
        source: RemoteError,
    },

    /// 直接远端调用失败
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// 受保护操作被限流，等待后可重试
    #[error("Rate limit exceeded for class {class}: retry in {wait_time_ms}ms")]
    RateLimitExceeded {
        class: String,
        wait_time_ms: u64,
        message: String,
    },

    /// 离线状态下调用 force_sync
    #[error("No connectivity")]
    NoConnectivity,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<sled::Error> for ClinicSyncError {
    fn from(error: sled::Error) -> Self {
        ClinicSyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for ClinicSyncError {
    fn from(error: serde_json::Error) -> Self {
        ClinicSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for ClinicSyncError {
    fn from(error: std::io::Error) -> Self {
        ClinicSyncError::IO(error.to_string())
    }
}

impl ClinicSyncError {
    /// 是否为本地存储错误（调用方应降级而不是中断）
    pub fn is_storage_error(&self) -> bool {
        matches!(self, ClinicSyncError::Storage(_))
    }

    /// 等待后重试是否可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            ClinicSyncError::RateLimitExceeded { .. } | ClinicSyncError::NoConnectivity => true,
            ClinicSyncError::RemoteFetch { source, .. }
            | ClinicSyncError::Replay { source, .. }
            | ClinicSyncError::Remote(source) => !matches!(
                source.kind,
                RemoteErrorKind::Validation | RemoteErrorKind::Conflict
            ),
            _ => false,
        }
    }

    /// 限流错误对应的等待时间（毫秒）
    pub fn wait_time_ms(&self) -> Option<u64> {
        match self {
            ClinicSyncError::RateLimitExceeded { wait_time_ms, .. } => Some(*wait_time_ms),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClinicSyncError>;
