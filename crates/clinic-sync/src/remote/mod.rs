//! 远端表存储接口
//!
//! 托管后端暴露的是「表 + 请求/响应」模型：
//! - `select(table, filter, order) -> rows`
//! - `insert / update / delete(table, payload) -> 确认 | 错误`
//!
//! 协调器把远端视为唯一可信数据源，不关心具体传输格式，只要求请求以成功或带类型的错误结束。

pub mod http;

pub use http::HttpRemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 远端返回的一行数据（字段集合对 SDK 不透明）
pub type Row = serde_json::Value;

/// 远端错误分类
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// 目标记录不存在
    NotFound,
    /// 版本冲突 / 唯一约束冲突
    Conflict,
    /// 未认证或权限不足
    Unauthorized,
    /// 服务端限流
    RateLimited,
    /// 请求数据不合法
    Validation,
    /// 服务端错误（HTTP 状态码）
    Server(u16),
    /// 传输层错误（超时、连接断开等）
    Transport,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::NotFound => write!(f, "not found"),
            RemoteErrorKind::Conflict => write!(f, "conflict"),
            RemoteErrorKind::Unauthorized => write!(f, "unauthorized"),
            RemoteErrorKind::RateLimited => write!(f, "rate limited"),
            RemoteErrorKind::Validation => write!(f, "validation"),
            RemoteErrorKind::Server(code) => write!(f, "server error {}", code),
            RemoteErrorKind::Transport => write!(f, "transport"),
        }
    }
}

/// 带类型的远端错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transport, message)
    }

    /// 根据 HTTP 状态码构造错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => RemoteErrorKind::Unauthorized,
            404 => RemoteErrorKind::NotFound,
            409 | 412 => RemoteErrorKind::Conflict,
            429 => RemoteErrorKind::RateLimited,
            400 | 422 => RemoteErrorKind::Validation,
            code => RemoteErrorKind::Server(code),
        };
        Self::new(kind, message)
    }
}

/// 等值过滤条件（column = value）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub eq: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.eq.is_empty()
    }
}

/// 排序方式，全量拉取时需要一个稳定的排序键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

impl Order {
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }
}

impl Default for Order {
    fn default() -> Self {
        Self::desc("created_at")
    }
}

/// 写操作确认
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Confirmation {
    /// 服务端返回的最新行（若有）
    pub row: Option<Row>,
}

impl Confirmation {
    pub fn with_row(row: Row) -> Self {
        Self { row: Some(row) }
    }
}

/// 远端表存储（由宿主实现，或使用内置的 [`HttpRemoteStore`]）
///
/// `expected_version` 仅在开启版本校验的冲突策略时传入，
/// 远端版本不一致时应返回 `RemoteErrorKind::Conflict`。
#[async_trait]
pub trait RemoteStore: Send + Sync + fmt::Debug {
    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: &Order,
    ) -> Result<Vec<Row>, RemoteError>;

    async fn insert(&self, table: &str, payload: &Row) -> Result<Confirmation, RemoteError>;

    async fn update(
        &self,
        table: &str,
        key: &str,
        payload: &Row,
        expected_version: Option<&str>,
    ) -> Result<Confirmation, RemoteError>;

    async fn delete(
        &self,
        table: &str,
        key: &str,
        expected_version: Option<&str>,
    ) -> Result<Confirmation, RemoteError>;
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 测试用：内存中的远端表存储，记录调用次数，可注入失败
    #[derive(Debug, Default)]
    pub struct MockRemoteStore {
        tables: Mutex<HashMap<String, Vec<Row>>>,
        failing_tables: Mutex<HashSet<String>>,
        failing_keys: Mutex<HashMap<String, RemoteError>>,
        applied: Mutex<Vec<String>>,
        select_calls: AtomicUsize,
        mutation_calls: AtomicUsize,
    }

    impl MockRemoteStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_table(self, table: &str, rows: Vec<Row>) -> Self {
            self.tables.lock().insert(table.to_string(), rows);
            self
        }

        pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
            self.tables.lock().insert(table.to_string(), rows);
        }

        pub fn fail_select(&self, table: &str) {
            self.failing_tables.lock().insert(table.to_string());
        }

        pub fn heal_select(&self, table: &str) {
            self.failing_tables.lock().remove(table);
        }

        /// 针对某个记录 key（或 create 的 payload.id）的写操作返回指定错误
        pub fn fail_mutation(&self, key: &str, error: RemoteError) {
            self.failing_keys.lock().insert(key.to_string(), error);
        }

        pub fn rows(&self, table: &str) -> Vec<Row> {
            self.tables.lock().get(table).cloned().unwrap_or_default()
        }

        /// 已成功应用的写操作，格式为 `{kind}:{table}:{key}`
        pub fn applied(&self) -> Vec<String> {
            self.applied.lock().clone()
        }

        pub fn select_calls(&self) -> usize {
            self.select_calls.load(Ordering::SeqCst)
        }

        pub fn mutation_calls(&self) -> usize {
            self.mutation_calls.load(Ordering::SeqCst)
        }

        pub fn total_calls(&self) -> usize {
            self.select_calls() + self.mutation_calls()
        }

        fn injected_failure(&self, key: &str) -> Option<RemoteError> {
            self.failing_keys.lock().get(key).cloned()
        }

        fn row_key(row: &Row) -> Option<String> {
            match row.get("id")? {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemoteStore {
        async fn select(
            &self,
            table: &str,
            _filter: &Filter,
            _order: &Order,
        ) -> Result<Vec<Row>, RemoteError> {
            self.select_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_tables.lock().contains(table) {
                return Err(RemoteError::transport(format!("fetch {} timed out", table)));
            }
            Ok(self.rows(table))
        }

        async fn insert(&self, table: &str, payload: &Row) -> Result<Confirmation, RemoteError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            let key = Self::row_key(payload).unwrap_or_default();
            if let Some(error) = self.injected_failure(&key) {
                return Err(error);
            }
            self.tables
                .lock()
                .entry(table.to_string())
                .or_default()
                .push(payload.clone());
            self.applied.lock().push(format!("create:{}:{}", table, key));
            Ok(Confirmation::with_row(payload.clone()))
        }

        async fn update(
            &self,
            table: &str,
            key: &str,
            payload: &Row,
            _expected_version: Option<&str>,
        ) -> Result<Confirmation, RemoteError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.injected_failure(key) {
                return Err(error);
            }
            let mut tables = self.tables.lock();
            let rows = tables.entry(table.to_string()).or_default();
            let row = rows
                .iter_mut()
                .find(|row| Self::row_key(row).as_deref() == Some(key))
                .ok_or_else(|| RemoteError::not_found(format!("{}/{}", table, key)))?;
            if let (Some(target), Some(patch)) = (row.as_object_mut(), payload.as_object()) {
                for (column, value) in patch {
                    target.insert(column.clone(), value.clone());
                }
            }
            let updated = row.clone();
            drop(tables);
            self.applied.lock().push(format!("update:{}:{}", table, key));
            Ok(Confirmation::with_row(updated))
        }

        async fn delete(
            &self,
            table: &str,
            key: &str,
            _expected_version: Option<&str>,
        ) -> Result<Confirmation, RemoteError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.injected_failure(key) {
                return Err(error);
            }
            let mut tables = self.tables.lock();
            let rows = tables.entry(table.to_string()).or_default();
            let before = rows.len();
            rows.retain(|row| Self::row_key(row).as_deref() != Some(key));
            if rows.len() == before {
                return Err(RemoteError::not_found(format!("{}/{}", table, key)));
            }
            drop(tables);
            self.applied.lock().push(format!("delete:{}:{}", table, key));
            Ok(Confirmation::default())
        }
    }
}
