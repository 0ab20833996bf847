//! 重连管理
//!
//! - `ReconnectBackoff`：离线时的探测间隔，从基础间隔指数增长到上限，成功后重置
//! - `ReconnectionManager`：后台连通性探测，独立于熔断器运行，
//!   探测结果驱动 `NetworkMonitor` 与熔断器恢复

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CircuitBreaker, NetworkMonitor, NetworkStatus};
use crate::config::ReconnectConfig;
use crate::error::{FlowSyncError, Result};

/// 轻量连通性探测（有界超时的请求）
#[async_trait]
pub trait ConnectivityPing: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

/// 重连退避
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: RwLock<Duration>,
    attempts: RwLock<u64>,
}

impl ReconnectBackoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        Self {
            base,
            max: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            multiplier: config.backoff_multiplier.max(1.0),
            current: RwLock::new(base),
            attempts: RwLock::new(0),
        }
    }

    /// 返回本次等待时间，并把下次等待时间按倍数增长（封顶）
    pub fn next_delay(&self) -> Duration {
        let mut current = self.current.write();
        let delay = *current;
        *current = current.mul_f64(self.multiplier).min(self.max);
        *self.attempts.write() += 1;
        debug!("重连尝试 #{}, 等待 {}ms", *self.attempts.read(), delay.as_millis());
        delay
    }

    /// 任意一次成功交互后恢复基础间隔
    pub fn reset(&self) {
        *self.current.write() = self.base;
        *self.attempts.write() = 0;
    }

    pub fn current(&self) -> Duration {
        *self.current.read()
    }

    pub fn attempts(&self) -> u64 {
        *self.attempts.read()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectStats {
    pub pings: u64,
    pub ping_failures: u64,
    pub backoff_attempts: u64,
    pub current_backoff_ms: u64,
}

/// 重连管理器
pub struct ReconnectionManager {
    config: ReconnectConfig,
    ping: Arc<dyn ConnectivityPing>,
    breaker: Arc<CircuitBreaker>,
    network: Arc<NetworkMonitor>,
    backoff: ReconnectBackoff,
    wake: Notify,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    pings: AtomicU64,
    ping_failures: AtomicU64,
}

impl ReconnectionManager {
    pub fn new(
        config: ReconnectConfig,
        ping: Arc<dyn ConnectivityPing>,
        breaker: Arc<CircuitBreaker>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            backoff: ReconnectBackoff::new(&config),
            config,
            ping,
            breaker,
            network,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
            pings: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
        }
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    /// 执行一次探测，返回是否连通
    pub async fn ping_once(&self) -> bool {
        self.pings.fetch_add(1, Ordering::Relaxed);
        let timeout = Duration::from_millis(self.config.ping_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.ping.ping()).await {
            Ok(result) => result,
            Err(_) => Err(FlowSyncError::Timeout("connectivity ping".to_string())),
        };

        match result {
            Ok(()) => {
                self.backoff.reset();
                self.breaker.on_ping_success();
                if self.network.set_status(NetworkStatus::Online).await {
                    info!("✅ 连通性恢复");
                }
                true
            }
            Err(e) => {
                self.ping_failures.fetch_add(1, Ordering::Relaxed);
                self.breaker.on_ping_failure();
                if self.network.set_status(NetworkStatus::Offline).await {
                    warn!("⚠️ 连通性探测失败，进入离线状态: {}", e);
                } else {
                    debug!("连通性探测失败: {}", e);
                }
                false
            }
        }
    }

    /// 立即重连：重置退避与熔断器后探测一次
    pub async fn force_reconnect(&self) -> bool {
        info!("🔄 强制重连");
        self.backoff.reset();
        self.breaker.reset();
        let online = self.ping_once().await;
        self.wake.notify_one();
        online
    }

    /// 唤醒探测循环（例如回到前台）
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 启动后台探测循环
    ///
    /// 在线时按固定间隔探测，离线时按退避间隔探测。
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let manager = self.clone();
        *handle = Some(tokio::spawn(async move {
            info!("Starting reconnection ping loop");
            loop {
                let delay = if manager.network.is_online().await {
                    manager.backoff.reset();
                    Duration::from_millis(manager.config.ping_interval_ms)
                } else {
                    manager.backoff.next_delay()
                };
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = manager.wake.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                manager.ping_once().await;
            }
            info!("Reconnection ping loop stopped");
        }));
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.handle.lock().take();
    }

    pub fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            pings: self.pings.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
            backoff_attempts: self.backoff.attempts(),
            current_backoff_ms: self.backoff.current().as_millis() as u64,
        }
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
