use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::utils::time::now_millis;

pub mod circuit_breaker;
pub mod reconnect;

pub use circuit_breaker::{BreakerState, BreakerStats, BreakerTransition, CircuitBreaker};
pub use reconnect::{ConnectivityPing, ReconnectBackoff, ReconnectionManager};

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 尚未探测
    Unknown,
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 离线（或未知）→ 在线
    pub fn is_recovery(&self) -> bool {
        self.new_status == NetworkStatus::Online && self.old_status != NetworkStatus::Online
    }
}

/// 网络监控管理器
///
/// 状态由连通性探测与远端调用结果驱动，只在状态真正变化时广播。
#[derive(Debug)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Unknown)),
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 更新网络状态，返回状态是否发生变化
    pub async fn set_status(&self, new_status: NetworkStatus) -> bool {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return false;
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
        true
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn is_online(&self) -> bool {
        self.get_status().await == NetworkStatus::Online
    }
}
