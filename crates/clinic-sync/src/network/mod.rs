use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::utils::time::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 平台尚未报告
    Unknown,
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    /// UTC 毫秒
    pub timestamp: i64,
}

/// 监控器对外广播的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// 状态发生变化（重复报告同一状态不产生事件）
    StatusChanged(NetworkStatusEvent),
    /// 离线 -> 在线，每次边沿恰好一次
    Restored { timestamp: i64 },
}

/// 网络状态监听器 trait（由宿主平台实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
///
/// 只响应平台事件，不做轮询。
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    event_sender: broadcast::Sender<NetworkEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (event_sender, _) = broadcast::channel(100);

        Self {
            listener,
            event_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Unknown)),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// 启动网络监控：读取初始状态，然后转发平台事件
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        *self.current_status.write().await = initial;
        info!("网络监控启动，初始状态: {:?}", initial);

        let mut receiver = self.listener.start_monitoring().await?;
        let event_sender = self.event_sender.clone();
        let current_status = self.current_status.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        apply_status(&current_status, &event_sender, event.new_status).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("平台网络事件流已关闭");
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// 停止监控
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态（宿主直接推送信号时使用）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        apply_status(&self.current_status, &self.event_sender, new_status).await;
    }

    pub async fn is_online(&self) -> bool {
        self.get_status().await == NetworkStatus::Online
    }

    pub async fn is_offline(&self) -> bool {
        self.get_status().await == NetworkStatus::Offline
    }

    /// 订阅网络事件，丢弃接收端即取消订阅
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_sender.subscribe()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// 更新状态并广播；持有写锁期间发送，保证 Restored 与状态变更顺序一致
async fn apply_status(
    current_status: &RwLock<NetworkStatus>,
    event_sender: &broadcast::Sender<NetworkEvent>,
    new_status: NetworkStatus,
) {
    let mut status = current_status.write().await;
    let old_status = *status;
    if old_status == new_status {
        return;
    }
    *status = new_status;

    let timestamp = now_millis();
    let _ = event_sender.send(NetworkEvent::StatusChanged(NetworkStatusEvent {
        old_status,
        new_status,
        timestamp,
    }));

    if old_status == NetworkStatus::Offline && new_status == NetworkStatus::Online {
        info!("🌐 网络已恢复");
        let _ = event_sender.send(NetworkEvent::Restored { timestamp });
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：可手动推送状态的网络状态监听器
    #[derive(Debug)]
    pub struct DummyNetworkStatusListener {
        status: Arc<RwLock<NetworkStatus>>,
        sender: Arc<RwLock<Option<broadcast::Sender<NetworkStatusEvent>>>>,
    }

    impl Default for DummyNetworkStatusListener {
        fn default() -> Self {
            Self::new(NetworkStatus::Online)
        }
    }

    impl DummyNetworkStatusListener {
        pub fn new(initial: NetworkStatus) -> Self {
            Self {
                status: Arc::new(RwLock::new(initial)),
                sender: Arc::new(RwLock::new(None)),
            }
        }

        /// 模拟平台报告一次网络状态
        pub async fn push(&self, new_status: NetworkStatus) {
            let old_status = {
                let mut status = self.status.write().await;
                std::mem::replace(&mut *status, new_status)
            };
            if let Some(sender) = self.sender.read().await.as_ref() {
                let _ = sender.send(NetworkStatusEvent {
                    old_status,
                    new_status,
                    timestamp: now_millis(),
                });
            }
        }
    }

    #[async_trait::async_trait]
    impl NetworkStatusListener for DummyNetworkStatusListener {
        async fn get_current_status(&self) -> NetworkStatus {
            *self.status.read().await
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
            let (tx, rx) = broadcast::channel(16);
            *self.sender.write().await = Some(tx);
            Ok(rx)
        }

        async fn stop_monitoring(&self) {
            *self.sender.write().await = None;
        }
    }
}

#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;
