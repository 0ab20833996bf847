use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::network::ConnectivityPing;
use crate::presence::DeviceHeartbeat;
use crate::storage::entities::Project;
use crate::storage::queue::QueuedAction;

/// 远端确认：动作已应用，返回项目的新版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub project_id: String,
    pub version: i64,
    pub updated_at: i64,
}

/// 远端后端边界
///
/// 实现方负责具体的网络协议。`apply_action` 必须按动作 ID 去重，
/// 同一动作重复投递时返回与首次相同的结果（至少一次投递）。
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn load_projects(&self, user_id: &str) -> Result<Vec<Project>>;

    async fn apply_action(&self, action: &QueuedAction) -> Result<RemoteAck>;

    /// 轻量连通性探测
    async fn ping(&self) -> Result<()>;

    /// 设备心跳，仅用于界面提示
    async fn publish_heartbeat(&self, _heartbeat: &DeviceHeartbeat) -> Result<()> {
        Ok(())
    }
}

/// 用远端传输做连通性探测
pub struct TransportPing {
    transport: Arc<dyn RemoteTransport>,
}

impl TransportPing {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ConnectivityPing for TransportPing {
    async fn ping(&self) -> Result<()> {
        self.transport.ping().await
    }
}
