//! 设备在线状态模块
//!
//! 功能包括：
//! - 记录其他设备的心跳（忽略本设备）
//! - 查询活跃窗口内的其他设备，用于“另一台设备正在编辑”的界面提示
//! - 设备从不活跃变为活跃时发布 `DeviceActivity` 事件
//!
//! 心跳只用于提示，不参与同步正确性判断。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::PresenceConfig;
use crate::events::{EventManager, SyncEvent};
use crate::utils::time::now_millis;

/// 设备心跳
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHeartbeat {
    pub device_id: String,
    pub last_seen_at: i64,
}

impl DeviceHeartbeat {
    pub fn now(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            last_seen_at: now_millis(),
        }
    }
}

/// 在线状态统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PresenceStats {
    pub known_devices: usize,
    pub active_devices: usize,
    pub heartbeats_received: u64,
}

/// 设备在线状态管理器
pub struct PresenceManager {
    device_id: String,
    config: PresenceConfig,
    /// device_id -> 最近一次心跳时间
    devices: Arc<RwLock<HashMap<String, i64>>>,
    heartbeats_received: Arc<RwLock<u64>>,
    event_manager: Arc<EventManager>,
}

impl PresenceManager {
    pub fn new(device_id: impl Into<String>, config: PresenceConfig, event_manager: Arc<EventManager>) -> Self {
        Self {
            device_id: device_id.into(),
            config,
            devices: Arc::new(RwLock::new(HashMap::new())),
            heartbeats_received: Arc::new(RwLock::new(0)),
            event_manager,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 本设备的心跳
    pub fn own_heartbeat(&self) -> DeviceHeartbeat {
        DeviceHeartbeat::now(&self.device_id)
    }

    fn is_active_at(&self, last_seen_at: i64, now: i64) -> bool {
        now - last_seen_at <= self.config.active_window_ms
    }

    /// 处理收到的心跳，返回该设备是否刚变为活跃
    pub async fn record_heartbeat(&self, heartbeat: DeviceHeartbeat) -> bool {
        if heartbeat.device_id == self.device_id {
            return false;
        }
        *self.heartbeats_received.write().await += 1;

        let now = now_millis();
        let became_active = {
            let mut devices = self.devices.write().await;
            let was_active = devices
                .get(&heartbeat.device_id)
                .map(|seen| self.is_active_at(*seen, now))
                .unwrap_or(false);
            let latest = devices
                .get(&heartbeat.device_id)
                .copied()
                .unwrap_or(i64::MIN)
                .max(heartbeat.last_seen_at);
            devices.insert(heartbeat.device_id.clone(), latest);
            !was_active && self.is_active_at(latest, now)
        };

        if became_active {
            debug!("设备活跃: {}", heartbeat.device_id);
            self.event_manager
                .emit(SyncEvent::DeviceActivity {
                    device_id: heartbeat.device_id,
                    last_seen_at: heartbeat.last_seen_at,
                    timestamp: now,
                })
                .await;
        }
        became_active
    }

    /// 活跃窗口内的其他设备
    pub async fn active_devices(&self) -> Vec<DeviceHeartbeat> {
        let now = now_millis();
        let devices = self.devices.read().await;
        let mut active: Vec<DeviceHeartbeat> = devices
            .iter()
            .filter(|(_, seen)| self.is_active_at(**seen, now))
            .map(|(device_id, seen)| DeviceHeartbeat {
                device_id: device_id.clone(),
                last_seen_at: *seen,
            })
            .collect();
        active.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        active
    }

    pub async fn has_other_active_device(&self) -> bool {
        !self.active_devices().await.is_empty()
    }

    /// 清理长时间没有心跳的设备
    pub async fn cleanup(&self) -> usize {
        let now = now_millis();
        let window = self.config.active_window_ms;
        let mut devices = self.devices.write().await;
        let before = devices.len();
        devices.retain(|_, seen| now - *seen <= window * 10);
        before - devices.len()
    }

    pub async fn stats(&self) -> PresenceStats {
        PresenceStats {
            known_devices: self.devices.read().await.len(),
            active_devices: self.active_devices().await.len(),
            heartbeats_received: *self.heartbeats_received.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (PresenceManager, Arc<EventManager>) {
        let events = Arc::new(EventManager::new(16));
        (
            PresenceManager::new("laptop", PresenceConfig::default(), events.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn test_own_heartbeat_ignored() {
        let (presence, _) = manager();
        assert!(!presence.record_heartbeat(presence.own_heartbeat()).await);
        assert!(!presence.has_other_active_device().await);
    }

    #[tokio::test]
    async fn test_activity_event_only_on_transition() {
        let (presence, events) = manager();
        let mut rx = events.subscribe();

        assert!(presence.record_heartbeat(DeviceHeartbeat::now("phone")).await);
        assert!(!presence.record_heartbeat(DeviceHeartbeat::now("phone")).await);
        assert_eq!(presence.active_devices().await.len(), 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type(), "device_activity");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_not_active() {
        let (presence, _) = manager();
        let stale = DeviceHeartbeat {
            device_id: "tablet".into(),
            last_seen_at: now_millis() - 10 * 60 * 1000,
        };
        assert!(!presence.record_heartbeat(stale).await);
        assert!(presence.active_devices().await.is_empty());
        assert_eq!(presence.stats().await.known_devices, 1);
    }
}
