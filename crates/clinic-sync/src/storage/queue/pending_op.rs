use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ClinicSyncError, Result};
use crate::remote::Row;
use crate::utils::time::now_millis;

/// 写操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// 待同步操作
///
/// 由应用层在离线或即时确认失败时创建，远端确认后由协调器删除；
/// 每次回放失败 `retry_count` 加一。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// 操作 ID（UUID v4）
    pub op_id: String,
    /// 存储分配的单调递增序号，决定回放顺序（入队前为 0）
    pub seq: u64,
    pub kind: OperationKind,
    pub table: String,
    /// 目标记录主键；create 可为空（由远端生成）
    pub key: Option<String>,
    pub payload: Row,
    /// 入队时间（UTC 毫秒）
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// 最后一次失败时间（UTC 毫秒）
    pub last_failure_at: Option<i64>,
    /// 本地修改所基于的远端版本（版本校验策略下作为期望版本发送）
    pub base_version: Option<String>,
}

impl PendingOperation {
    fn new(kind: OperationKind, table: &str, key: Option<String>, payload: Row) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            kind,
            table: table.to_string(),
            key,
            payload,
            enqueued_at: now_millis(),
            retry_count: 0,
            last_error: None,
            last_failure_at: None,
            base_version: None,
        }
    }

    pub fn create(table: &str, payload: Row) -> Self {
        Self::create_keyed(table, "id", payload)
    }

    /// 新增操作，记录主键取自 `payload[primary_key]`
    pub fn create_keyed(table: &str, primary_key: &str, payload: Row) -> Self {
        let key = payload.get(primary_key).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
        Self::new(OperationKind::Create, table, key, payload)
    }

    pub fn update(table: &str, key: &str, payload: Row) -> Self {
        Self::new(OperationKind::Update, table, Some(key.to_string()), payload)
    }

    pub fn delete(table: &str, key: &str) -> Self {
        Self::new(
            OperationKind::Delete,
            table,
            Some(key.to_string()),
            serde_json::Value::Null,
        )
    }

    pub fn with_base_version(mut self, version: impl Into<String>) -> Self {
        self.base_version = Some(version.into());
        self
    }

    /// 记录一次回放失败
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.last_failure_at = Some(now_millis());
    }

    /// 入队前校验
    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(ClinicSyncError::InvalidArgument("表名不能为空".to_string()));
        }
        match self.kind {
            OperationKind::Update | OperationKind::Delete if self.key.is_none() => {
                Err(ClinicSyncError::InvalidArgument(format!(
                    "{} 操作必须指定记录主键",
                    self.kind
                )))
            }
            OperationKind::Create | OperationKind::Update if !self.payload.is_object() => {
                Err(ClinicSyncError::InvalidArgument(format!(
                    "{} 操作的 payload 必须是 JSON 对象",
                    self.kind
                )))
            }
            _ => Ok(()),
        }
    }

    /// 日志用的简短描述，例如 `update patients/P2`
    pub fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            self.kind,
            self.table,
            self.key.as_deref().unwrap_or("-")
        )
    }
}
