use std::sync::Arc;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SyncReconciler;
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkEvent, NetworkMonitor};

/// 网络事件桥接任务
///
/// 把监控器的网络事件转发到事件总线；开启自动同步时，
/// 每次网络恢复触发一次 `sync_all`（从不按定时器触发）。
#[derive(Debug)]
pub struct AutoSyncHandle {
    shutdown: Arc<Notify>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AutoSyncHandle {
    pub fn spawn(
        reconciler: Arc<SyncReconciler>,
        monitor: &NetworkMonitor,
        events: Arc<EventManager>,
        sync_on_restore: bool,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let mut receiver = monitor.subscribe();
        let stop_signal = shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    event = receiver.recv() => match event {
                        Ok(NetworkEvent::StatusChanged(change)) => {
                            events
                                .emit(SyncEvent::NetworkStatusChanged {
                                    old_status: change.old_status,
                                    new_status: change.new_status,
                                    timestamp: change.timestamp,
                                })
                                .await;
                        }
                        Ok(NetworkEvent::Restored { timestamp }) => {
                            events.emit(SyncEvent::NetworkRestored { timestamp }).await;
                            if sync_on_restore {
                                info!("🌐 网络恢复，自动同步");
                                if let Err(e) = reconciler.sync_all().await {
                                    warn!("自动同步失败: {}", e);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("网络事件积压，跳过 {} 条", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("自动同步任务退出");
        });

        Self {
            shutdown,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// 取消订阅并等待任务退出（正在进行的同步会先完成）
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("自动同步任务异常退出: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
