//! 基于 reqwest 的远端表存储实现（PostgREST 风格 REST 接口）
//!
//! - 查询：`GET {base}/rest/v1/{table}?select=*&order={col}.desc`
//! - 新增：`POST {base}/rest/v1/{table}`
//! - 修改：`PATCH {base}/rest/v1/{table}?{pk}=eq.{key}`
//! - 删除：`DELETE {base}/rest/v1/{table}?{pk}=eq.{key}`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::{debug, warn};

use super::{Confirmation, Filter, Order, RemoteError, RemoteErrorKind, RemoteStore, Row};
use crate::config::{RemoteConfig, SyncTableConfig};
use crate::error::{ClinicSyncError, Result};

#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    primary_key: String,
    table_keys: HashMap<String, String>,
    version_column: String,
}

impl HttpRemoteStore {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| ClinicSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            primary_key: config.primary_key.clone(),
            table_keys: HashMap::new(),
            version_column: config.version_column.clone(),
        })
    }

    /// 更新访问令牌（登录态由宿主管理）
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// 按表覆盖主键列（未登记的表使用 `RemoteConfig.primary_key`）
    pub fn with_tables(mut self, tables: &[SyncTableConfig]) -> Self {
        for table in tables {
            self.table_keys
                .insert(table.name.clone(), table.primary_key.clone());
        }
        self
    }

    fn primary_key_for(&self, table: &str) -> &str {
        self.table_keys
            .get(table)
            .map(String::as_str)
            .unwrap_or(&self.primary_key)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    fn key_query(
        &self,
        table: &str,
        key: &str,
        expected_version: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut query = vec![(self.primary_key_for(table).to_string(), format!("eq.{}", key))];
        if let Some(version) = expected_version {
            query.push((self.version_column.clone(), format!("eq.{}", version)));
        }
        query
    }

    async fn send(&self, builder: RequestBuilder) -> std::result::Result<Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!("远端请求失败: status={}, body={}", status, body);
        Err(RemoteError::from_status(status.as_u16(), body))
    }

    async fn confirmation(response: Response) -> std::result::Result<Confirmation, RemoteError> {
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::transport(format!("读取响应失败: {}", e)))?;
        let rows = parse_rows(&body)?;
        Ok(Confirmation {
            row: rows.into_iter().next(),
        })
    }
}

/// 解析 `return=representation` 返回的行数组；空响应体视为没有行
pub(crate) fn parse_rows(body: &str) -> std::result::Result<Vec<Row>, RemoteError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|e| RemoteError::transport(format!("解析响应失败: {}", e)))
}

/// 修改 / 删除匹配不到任何行时远端仍返回 200 和空数组：
/// 带版本校验时视为版本冲突，否则视为记录不存在
pub(crate) fn check_row_matched(
    confirmation: &Confirmation,
    table: &str,
    key: &str,
    expected_version: Option<&str>,
) -> std::result::Result<(), RemoteError> {
    if confirmation.row.is_some() {
        return Ok(());
    }
    match expected_version {
        Some(_) => Err(RemoteError::new(
            RemoteErrorKind::Conflict,
            "row version changed on server",
        )),
        None => Err(RemoteError::not_found(format!("{}/{}", table, key))),
    }
}

/// 生成查询参数：`select=*`、等值过滤、排序
pub(crate) fn select_query(filter: &Filter, order: &Order) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    for (column, value) in &filter.eq {
        query.push((column.clone(), format!("eq.{}", value)));
    }
    let direction = if order.descending { "desc" } else { "asc" };
    query.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    query
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: &Order,
    ) -> std::result::Result<Vec<Row>, RemoteError> {
        debug!("拉取远端表: {}", table);
        let builder = self
            .request(Method::GET, table)
            .query(&select_query(filter, order));
        let response = self.send(builder).await?;
        response
            .json::<Vec<Row>>()
            .await
            .map_err(|e| RemoteError::transport(format!("解析响应失败: {}", e)))
    }

    async fn insert(&self, table: &str, payload: &Row) -> std::result::Result<Confirmation, RemoteError> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(payload);
        let response = self.send(builder).await?;
        Self::confirmation(response).await
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        payload: &Row,
        expected_version: Option<&str>,
    ) -> std::result::Result<Confirmation, RemoteError> {
        let builder = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&self.key_query(table, key, expected_version))
            .json(payload);
        let response = self.send(builder).await?;
        let confirmation = Self::confirmation(response).await?;
        check_row_matched(&confirmation, table, key, expected_version)?;
        Ok(confirmation)
    }

    async fn delete(
        &self,
        table: &str,
        key: &str,
        expected_version: Option<&str>,
    ) -> std::result::Result<Confirmation, RemoteError> {
        let builder = self
            .request(Method::DELETE, table)
            .header("Prefer", "return=representation")
            .query(&self.key_query(table, key, expected_version));
        let response = self.send(builder).await?;
        let confirmation = Self::confirmation(response).await?;
        check_row_matched(&confirmation, table, key, expected_version)?;
        Ok(confirmation)
    }
}
