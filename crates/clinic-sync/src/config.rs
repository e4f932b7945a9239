use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ClinicSyncError, Result};
use crate::rate_limiter::RateLimiterConfig;
use crate::storage::queue::RetryPolicy;
use crate::sync::ConflictPolicy;

/// 默认同步的表
pub const DEFAULT_SYNC_TABLES: &[&str] = &["patients", "appointments", "invoices", "dental_charts"];

/// 需要全量同步的表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTableConfig {
    pub name: String,
    /// 主键列
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// 全量拉取的稳定排序键
    #[serde(default = "default_order_by")]
    pub order_by: String,
    #[serde(default = "default_descending")]
    pub descending: bool,
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_order_by() -> String {
    "created_at".to_string()
}

fn default_descending() -> bool {
    true
}

impl SyncTableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
            order_by: default_order_by(),
            descending: default_descending(),
        }
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = column.into();
        self.descending = descending;
        self
    }
}

/// 远端 REST 接口配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// 例如 https://xyz.example.co
    pub base_url: String,
    /// 公开的 anon key
    pub api_key: String,
    /// 登录后的访问令牌（为空时使用 api_key）
    pub access_token: Option<String>,
    /// 请求超时（秒）
    pub timeout_seconds: u64,
    /// 主键列
    pub primary_key: String,
    /// 版本校验使用的列
    pub version_column: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            timeout_seconds: 30,
            primary_key: default_primary_key(),
            version_column: "updated_at".to_string(),
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件广播缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// SDK 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicSyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 需要同步的表
    pub tables: Vec<SyncTableConfig>,
    /// 远端配置（使用内置 HTTP 实现时需要）
    pub remote: RemoteConfig,
    /// 回放重试策略
    pub retry_policy: RetryPolicy,
    /// 冲突策略
    pub conflict_policy: ConflictPolicy,
    /// 限流配置
    pub rate_limiter: RateLimiterConfig,
    /// 事件配置
    pub event_config: EventConfig,
    /// 限流使用的调用方标识（通常是当前用户 ID）
    pub client_identity: String,
    /// 网络恢复时自动同步
    pub auto_sync: bool,
}

impl Default for ClinicSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./clinic_sync_data"),
            tables: DEFAULT_SYNC_TABLES
                .iter()
                .map(|name| SyncTableConfig::new(*name))
                .collect(),
            remote: RemoteConfig::default(),
            retry_policy: RetryPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            rate_limiter: RateLimiterConfig::default(),
            event_config: EventConfig::default(),
            client_identity: "anonymous".to_string(),
            auto_sync: true,
        }
    }
}

impl ClinicSyncConfig {
    pub fn builder() -> ClinicSyncConfigBuilder {
        ClinicSyncConfigBuilder::new()
    }

    /// 从 JSON 文件加载配置，缺失字段使用默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ClinicSyncError::Config(format!(
                "读取配置文件失败 {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ClinicSyncError::Config(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(ClinicSyncError::Config("至少需要配置一张同步表".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() || table.primary_key.is_empty() || table.order_by.is_empty() {
                return Err(ClinicSyncError::Config(format!(
                    "同步表配置不完整: {:?}",
                    table
                )));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(ClinicSyncError::Config(format!(
                    "同步表重复: {}",
                    table.name
                )));
            }
        }
        if self.event_config.buffer_size == 0 {
            return Err(ClinicSyncError::Config(
                "event_config.buffer_size 必须大于 0".to_string(),
            ));
        }
        if self.client_identity.is_empty() {
            return Err(ClinicSyncError::Config("client_identity 不能为空".to_string()));
        }
        self.rate_limiter.validate()
    }

    pub fn table(&self, name: &str) -> Option<&SyncTableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// 表的主键列；未配置的表使用远端默认主键
    pub fn primary_key_for(&self, table: &str) -> &str {
        self.table(table)
            .map(|t| t.primary_key.as_str())
            .unwrap_or(&self.remote.primary_key)
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct ClinicSyncConfigBuilder {
    config: ClinicSyncConfig,
}

impl ClinicSyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// 按表名设置同步表（使用默认主键与排序）
    pub fn tables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tables = names.into_iter().map(SyncTableConfig::new).collect();
        self
    }

    pub fn add_table(mut self, table: SyncTableConfig) -> Self {
        self.config.tables.retain(|t| t.name != table.name);
        self.config.tables.push(table);
        self
    }

    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = remote;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.config.conflict_policy = policy;
        self
    }

    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limiter = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_config.buffer_size = size;
        self
    }

    pub fn client_identity(mut self, identity: impl Into<String>) -> Self {
        self.config.client_identity = identity.into();
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn build(self) -> ClinicSyncConfig {
        self.config
    }
}
