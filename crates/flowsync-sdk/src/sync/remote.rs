//! 远端调用包装：熔断器放行检查与分级超时

use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::transport::{RemoteAck, RemoteTransport};
use crate::config::{OperationTier, TimeoutConfig};
use crate::error::{FlowSyncError, Result};
use crate::network::CircuitBreaker;
use crate::presence::DeviceHeartbeat;
use crate::storage::entities::Project;
use crate::storage::queue::QueuedAction;

/// 受熔断器与分级超时保护的远端
///
/// - 熔断器打开时直接返回 `BreakerOpen`，不发起调用
/// - 超时转换为可重试的 `Timeout` 并计入熔断失败
/// - 校验类失败说明远端正常响应，不计入熔断失败
pub struct GuardedRemote {
    transport: Arc<dyn RemoteTransport>,
    breaker: Arc<CircuitBreaker>,
    timeouts: TimeoutConfig,
}

impl GuardedRemote {
    pub fn new(transport: Arc<dyn RemoteTransport>, breaker: Arc<CircuitBreaker>, timeouts: TimeoutConfig) -> Self {
        Self {
            transport,
            breaker,
            timeouts,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.transport
    }

    async fn call<T, F>(&self, tier: OperationTier, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.breaker.try_acquire()?;

        let limit = self.timeouts.for_tier(tier);
        let result = match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(FlowSyncError::Timeout(format!(
                "{} exceeded {}ms",
                what,
                limit.as_millis()
            ))),
        };

        match &result {
            Err(e) if e.counts_against_breaker() => {
                debug!("远端调用失败 [{}]: {}", what, e);
                self.breaker.record_failure();
            }
            _ => self.breaker.record_success(),
        }
        result
    }

    pub async fn load_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        self.call(
            OperationTier::HeavyAggregation,
            "load_projects",
            self.transport.load_projects(user_id),
        )
        .await
    }

    pub async fn apply_action(&self, action: &QueuedAction) -> Result<RemoteAck> {
        self.call(
            OperationTier::StandardWrite,
            "apply_action",
            self.transport.apply_action(action),
        )
        .await
    }

    /// 发布心跳，熔断器打开时跳过，结果不影响熔断器
    pub async fn publish_heartbeat(&self, heartbeat: &DeviceHeartbeat) -> Result<bool> {
        if self.breaker.is_open() {
            return Ok(false);
        }
        let limit = self.timeouts.for_tier(OperationTier::RealtimeConnect);
        match tokio::time::timeout(limit, self.transport.publish_heartbeat(heartbeat)).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Err(FlowSyncError::Timeout("publish_heartbeat".to_string())),
        }
    }
}
