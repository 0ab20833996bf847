use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};

use super::ActionQueue;
use crate::error::{FlowSyncError, Result};
use crate::utils::time::now_millis;

/// 队列的执行方（同步协调器）
#[async_trait]
pub trait DrainTarget: Send + Sync {
    /// 执行所有可执行项目的队首动作，返回本轮处理的动作数量
    async fn drain_ready(&self) -> Result<usize>;
}

/// 消费者配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// 没有唤醒信号时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 停止时等待当前轮次结束的时间（毫秒）
    pub stop_grace_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            stop_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainMetrics {
    pub drain_cycles: u64,
    pub actions_processed: u64,
    pub errors: u64,
}

impl DrainMetrics {
    pub fn average_batch(&self) -> f64 {
        if self.drain_cycles == 0 {
            0.0
        } else {
            self.actions_processed as f64 / self.drain_cycles as f64
        }
    }
}

/// 动作消费者运行器
///
/// 挂载到队列后，在有新动作、重试到期或轮询间隔到达时驱动执行方。
pub struct ActionConsumerRunner {
    config: ConsumerConfig,
    queue: Arc<ActionQueue>,
    target: Arc<dyn DrainTarget>,
    metrics: Arc<RwLock<DrainMetrics>>,
    shutdown_signal: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl ActionConsumerRunner {
    pub fn new(config: ConsumerConfig, queue: Arc<ActionQueue>, target: Arc<dyn DrainTarget>) -> Self {
        Self {
            config,
            queue,
            target,
            metrics: Arc::new(RwLock::new(DrainMetrics::default())),
            shutdown_signal: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
            handle: SyncMutex::new(None),
        }
    }

    /// 距离下一次需要执行的等待时间
    fn next_wait(queue: &ActionQueue, poll_interval: Duration) -> Duration {
        match queue.next_retry_at() {
            Some(at) => {
                let until = Duration::from_millis((at - now_millis()).max(0) as u64);
                until.min(poll_interval)
            }
            None => poll_interval,
        }
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(FlowSyncError::InvalidOperation("Consumer already running".to_string()));
            }
            *running = true;
        }

        self.queue.attach_consumer();
        info!("Starting ActionConsumer (poll {}ms)", self.config.poll_interval_ms);

        let queue = self.queue.clone();
        let target = self.target.clone();
        let metrics = self.metrics.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let is_running = self.is_running.clone();
        let wake = self.queue.wake_handle();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            loop {
                let wait = Self::next_wait(&queue, poll_interval);
                select! {
                    _ = shutdown_signal.notified() => break,
                    _ = wake.notified() => {}
                    _ = sleep(wait) => {}
                }
                if !*is_running.read().await {
                    break;
                }

                let result = target.drain_ready().await;
                let mut m = metrics.write().await;
                m.drain_cycles += 1;
                match result {
                    Ok(processed) => {
                        m.actions_processed += processed as u64;
                        if processed > 0 {
                            debug!("本轮处理 {} 个动作", processed);
                        }
                    }
                    Err(e) => {
                        m.errors += 1;
                        error!("❌ 队列执行失败: {}", e);
                    }
                }
            }
            queue.detach_consumer();
            info!("ActionConsumer stopped");
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }
        self.shutdown_signal.notify_waiters();

        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            let grace = Duration::from_millis(self.config.stop_grace_ms);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                self.queue.detach_consumer();
            }
        }
        Ok(())
    }

    pub async fn get_metrics(&self) -> DrainMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}
