//! FlowSync SDK 主入口
//!
//! 负责按层初始化各组件、启动后台任务，并向展示层提供统一的操作接口。
//! 所有操作返回 [`SyncOutcome`]，调用方据此区分成功、可重试失败与终态失败。
//!
//! 后台任务：
//! - 动作消费者（驱动队列执行）
//! - 连通性探测与重连退避
//! - 本地检查点（固定间隔自动保存）
//! - 快照清理、停滞检测、冲突归档
//! - 设备心跳
//! - 熔断器/连通性状态转发，恢复在线时执行重连合并

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FlowSyncConfig;
use crate::error::{FlowSyncError, Result, SyncOutcome};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
use crate::lifecycle::{LifecycleHook, LifecycleManager};
use crate::network::reconnect::ReconnectStats;
use crate::network::{BreakerState, BreakerStats, CircuitBreaker, NetworkMonitor, ReconnectionManager};
use crate::presence::{DeviceHeartbeat, PresenceManager, PresenceStats};
use crate::storage::entities::{ConflictRecord, ConflictStrategy, Project};
use crate::storage::queue::{
    ActionConsumerRunner, ActionQueue, ConsumerConfig, DrainTarget, Mutation, QueueStats, QueuedAction, RetryPolicy,
};
use crate::storage::StorageManager;
use crate::sync::{
    CoordinatorParts, GuardedRemote, LoadResult, PendingConflict, PushOutcome, RemoteTransport, SnapshotTracker,
    SyncCoordinator, TransportPing,
};
use crate::utils::time::now_millis;

/// 冲突归档检查间隔
const CONFLICT_ARCHIVE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// 冲突通知（`on_conflict` 回调参数）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictNotice {
    pub project_id: String,
    pub local_version: i64,
    pub remote_version: i64,
    pub pending_actions: usize,
}

/// SDK 运行状态汇总
#[derive(Debug, Clone, Serialize)]
pub struct SdkStats {
    pub queue: QueueStats,
    pub breaker: BreakerStats,
    pub reconnect: ReconnectStats,
    pub presence: PresenceStats,
    pub pending_conflicts: usize,
    pub storage_degraded: bool,
    pub storage_write_failures: u64,
}

/// 前后台切换时的同步处理
struct SyncLifecycleHook {
    coordinator: Arc<SyncCoordinator>,
    reconnect: Arc<ReconnectionManager>,
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        let flushed = self.coordinator.flush_pending_saves().await;
        let saved = self.coordinator.checkpoint_now().await?;
        info!("💾 进入后台: 提交 {} 个去抖保存, 写入 {} 个检查点", flushed, saved);
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        let online = self.reconnect.ping_once().await;
        self.reconnect.wake();
        debug!("回到前台，连通性: {}", online);
        Ok(())
    }
}

/// FlowSync SDK
pub struct FlowSyncSDK {
    config: FlowSyncConfig,
    storage: Arc<StorageManager>,
    events: Arc<EventManager>,
    network: Arc<NetworkMonitor>,
    breaker: Arc<CircuitBreaker>,
    remote: Arc<GuardedRemote>,
    queue: Arc<ActionQueue>,
    coordinator: Arc<SyncCoordinator>,
    reconnect: Arc<ReconnectionManager>,
    consumer: ActionConsumerRunner,
    presence: Arc<PresenceManager>,
    lifecycle: Arc<RwLock<LifecycleManager>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    initialized: Arc<RwLock<bool>>,
    shutting_down: Arc<RwLock<bool>>,
}

impl FlowSyncSDK {
    /// 初始化 SDK 并启动后台任务
    pub async fn initialize(config: FlowSyncConfig, transport: Arc<dyn RemoteTransport>) -> Result<Arc<Self>> {
        info!("正在初始化 FlowSyncSDK...");
        config.validate()?;

        // === 第1层：存储管理器 ===
        let storage = match StorageManager::new(&config.data_dir).await {
            Ok(storage) => storage,
            Err(e) => {
                error!("❌ 无法创建存储目录: {}", e);
                let storage = StorageManager::in_memory();
                storage.mark_degraded(&format!("存储目录不可用: {}", e));
                storage
            }
        };
        let storage = Arc::new(storage);
        let mut degraded_reason = storage.init_user_or_degrade(&config.user_id).await?;
        if degraded_reason.is_none() {
            degraded_reason = storage.degraded_reason();
        }

        // === 第2层：事件、网络状态、熔断器 ===
        let events = Arc::new(EventManager::new(config.event.buffer_size));
        let network = Arc::new(NetworkMonitor::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let remote = Arc::new(GuardedRemote::new(
            transport.clone(),
            breaker.clone(),
            config.timeouts.clone(),
        ));

        // === 第3层：队列与快照 ===
        let queue = Arc::new(ActionQueue::new(
            RetryPolicy::from(&config.retry),
            Some(storage.clone()),
        ));
        let snapshots = Arc::new(SnapshotTracker::new(config.snapshot.clone(), Some(storage.clone())));

        // === 第4层：同步协调器 ===
        let coordinator = SyncCoordinator::new(
            config.sync.clone(),
            config.conflict.clone(),
            config.undo.clone(),
            CoordinatorParts {
                queue: queue.clone(),
                snapshots,
                remote: remote.clone(),
                events: events.clone(),
                network: network.clone(),
                storage: Some(storage.clone()),
            },
        );
        match coordinator.restore_local().await {
            Ok(restored) => info!("✅ 本地数据恢复完成: {} 个项目", restored),
            Err(e) => warn!("⚠️ 本地数据恢复失败，从空状态开始: {}", e),
        }

        // === 第5层：重连管理器、消费者、在线状态 ===
        let reconnect = Arc::new(ReconnectionManager::new(
            config.reconnect.clone(),
            Arc::new(TransportPing::new(transport)),
            breaker.clone(),
            network.clone(),
        ));
        let consumer = ActionConsumerRunner::new(
            ConsumerConfig {
                poll_interval_ms: config.sync.drain_poll_interval_ms,
                ..ConsumerConfig::default()
            },
            queue.clone(),
            coordinator.clone() as Arc<dyn DrainTarget>,
        );
        let presence = Arc::new(PresenceManager::new(
            config.device_id.clone(),
            config.presence.clone(),
            events.clone(),
        ));

        // === 第6层：生命周期管理器 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook {
            coordinator: coordinator.clone(),
            reconnect: reconnect.clone(),
        }));

        let sdk = Arc::new(Self {
            config,
            storage,
            events,
            network,
            breaker,
            remote,
            queue,
            coordinator,
            reconnect,
            consumer,
            presence,
            lifecycle: Arc::new(RwLock::new(lifecycle)),
            background: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            initialized: Arc::new(RwLock::new(false)),
            shutting_down: Arc::new(RwLock::new(false)),
        });

        if let Some(reason) = degraded_reason {
            warn!("⚠️ 存储降级，数据仅保存在内存中: {}", reason);
            sdk.events
                .emit(SyncEvent::StorageDegraded {
                    reason,
                    timestamp: now_millis(),
                })
                .await;
        }

        sdk.start_background_tasks().await?;
        *sdk.initialized.write().await = true;
        info!("✅ FlowSyncSDK 初始化完成 (user={}, device={})", sdk.config.user_id, sdk.config.device_id);
        Ok(sdk)
    }

    // ========== 后台任务 ==========

    async fn start_background_tasks(&self) -> Result<()> {
        if self.config.sync.auto_drain {
            self.consumer.start().await?;
        }
        self.reconnect.start();
        if let Some(handle) = self.coordinator.start_push_replay() {
            self.background.lock().push(handle);
        }

        self.spawn_breaker_forwarder();
        self.spawn_network_forwarder();

        let coordinator = self.coordinator.clone();
        self.spawn_periodic(
            "autosave",
            Duration::from_millis(self.config.sync.autosave_interval_ms),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    if let Err(e) = coordinator.checkpoint_now().await {
                        warn!("⚠️ 自动保存检查点失败: {}", e);
                    }
                }
            },
        );

        let coordinator = self.coordinator.clone();
        self.spawn_periodic(
            "snapshot-sweep",
            Duration::from_millis(self.config.snapshot.sweep_interval_ms),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    let evicted = coordinator.sweep_snapshots().await;
                    if evicted > 0 {
                        debug!("🧹 快照清理: 淘汰 {} 个", evicted);
                    }
                }
            },
        );

        let queue = self.queue.clone();
        let events = self.events.clone();
        let stall_timeout = Duration::from_millis(self.config.sync.stall_timeout_ms);
        self.spawn_periodic("stall-watchdog", stall_timeout / 2, move || {
            let queue = queue.clone();
            let events = events.clone();
            async move {
                if let Some(pending) = queue.check_stalled(stall_timeout) {
                    events
                        .emit(SyncEvent::QueueStalled {
                            pending,
                            timestamp: now_millis(),
                        })
                        .await;
                }
            }
        });

        let coordinator = self.coordinator.clone();
        self.spawn_periodic("conflict-archive", CONFLICT_ARCHIVE_INTERVAL, move || {
            let coordinator = coordinator.clone();
            async move {
                match coordinator.archive_conflicts().await {
                    Ok(0) => {}
                    Ok(archived) => debug!("🗑️ 归档冲突记录: {} 条", archived),
                    Err(e) => warn!("⚠️ 归档冲突记录失败: {}", e),
                }
            }
        });

        if self.config.presence.enabled {
            let remote = self.remote.clone();
            let presence = self.presence.clone();
            self.spawn_periodic(
                "presence-heartbeat",
                Duration::from_millis(self.config.presence.heartbeat_interval_ms),
                move || {
                    let remote = remote.clone();
                    let presence = presence.clone();
                    async move {
                        presence.cleanup().await;
                        if remote.breaker().is_open() {
                            return;
                        }
                        if let Err(e) = remote.publish_heartbeat(&presence.own_heartbeat()).await {
                            debug!("心跳发送失败: {}", e);
                        }
                    }
                },
            );
        }

        Ok(())
    }

    /// 固定间隔执行，首个周期结束后才第一次触发
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("后台任务已停止: {}", name);
        });
        self.background.lock().push(handle);
    }

    fn spawn_breaker_forwarder(&self) {
        let mut transitions = self.breaker.subscribe();
        let events = self.events.clone();
        let queue = self.queue.clone();
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let transition = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = transitions.recv() => received,
                };
                match transition {
                    Ok(transition) => {
                        if transition.new_state == BreakerState::Closed {
                            // 熔断期间暂停的动作立即恢复执行
                            queue.wake_handle().notify_one();
                        }
                        events
                            .emit(SyncEvent::BreakerStateChanged {
                                old_state: transition.old_state,
                                new_state: transition.new_state,
                                timestamp: transition.timestamp,
                            })
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠️ 熔断器事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.background.lock().push(handle);
    }

    fn spawn_network_forwarder(&self) {
        let mut changes = self.network.subscribe();
        let events = self.events.clone();
        let coordinator = self.coordinator.clone();
        let queue = self.queue.clone();
        let user_id = self.config.user_id.clone();
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = changes.recv() => received,
                };
                let change = match change {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠️ 网络状态事件积压，跳过 {} 条", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                events
                    .emit(SyncEvent::ConnectivityChanged {
                        online: change.new_status == crate::network::NetworkStatus::Online,
                        timestamp: change.timestamp,
                    })
                    .await;
                if change.is_recovery() {
                    info!("🔄 网络恢复，开始重连合并");
                    match coordinator.reconnect_merge(&user_id).await {
                        Ok(projects) => info!("✅ 重连合并完成: {} 个项目", projects.len()),
                        Err(e) => warn!("⚠️ 重连合并失败: {}", e),
                    }
                    queue.wake_handle().notify_one();
                }
            }
        });
        self.background.lock().push(handle);
    }

    // ========== 状态 ==========

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().await
    }

    async fn check_initialized(&self) -> Result<()> {
        if !self.is_initialized().await {
            return Err(FlowSyncError::NotInitialized("SDK 未初始化".to_string()));
        }
        if self.is_shutting_down().await {
            return Err(FlowSyncError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    async fn guarded<T, Fut>(&self, op: Fut) -> SyncOutcome<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if let Err(e) = self.check_initialized().await {
            return SyncOutcome::Terminal(e);
        }
        op.await.into()
    }

    pub fn config(&self) -> &FlowSyncConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub fn projects(&self) -> Vec<Project> {
        self.coordinator.projects()
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.coordinator.project(project_id)
    }

    /// 本地存储不可用，需要提示用户导出数据
    pub fn is_storage_degraded(&self) -> bool {
        self.storage.is_degraded()
    }

    pub async fn is_online(&self) -> bool {
        self.network.is_online().await
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    // ========== 本地变更 ==========

    /// 提交一次本地变更，返回动作 ID
    pub async fn enqueue_mutation(&self, project_id: &str, mutation: Mutation) -> SyncOutcome<String> {
        self.guarded(self.coordinator.apply_mutation(project_id, mutation, false))
            .await
    }

    /// 提交可合并的本地变更（连续文本编辑等）
    pub async fn enqueue_coalescible(&self, project_id: &str, mutation: Mutation) -> SyncOutcome<String> {
        self.guarded(self.coordinator.apply_mutation(project_id, mutation, true))
            .await
    }

    /// 去抖保存整个项目
    pub async fn save_project(&self, project: Project) -> SyncOutcome<()> {
        self.guarded(async {
            self.coordinator.save_project(project);
            Ok(())
        })
        .await
    }

    /// 立即执行一轮队列消费，返回处理的动作数
    pub async fn drain_now(&self) -> SyncOutcome<usize> {
        self.guarded(async { Ok(self.coordinator.drain_once().await) }).await
    }

    // ========== 加载 ==========

    /// 加载当前用户的项目，远端不可用时返回本地数据并标记离线
    pub async fn load_projects(&self) -> SyncOutcome<LoadResult> {
        self.guarded(self.coordinator.load(&self.config.user_id)).await
    }

    // ========== 远端推送与编辑锁 ==========

    pub async fn handle_remote_push(&self, project: Project) -> SyncOutcome<PushOutcome> {
        self.guarded(self.coordinator.handle_remote_push(project)).await
    }

    pub fn begin_editing(&self, project_id: &str) {
        self.coordinator.begin_editing(project_id);
    }

    pub async fn end_editing(&self, project_id: &str) -> SyncOutcome<Option<PushOutcome>> {
        self.guarded(self.coordinator.end_editing(project_id)).await
    }

    // ========== 冲突 ==========

    /// 注册冲突回调
    pub async fn on_conflict<F>(&self, callback: F)
    where
        F: Fn(&ConflictNotice) + Send + Sync + 'static,
    {
        self.events
            .add_listener("conflict_raised", move |event| {
                if let SyncEvent::ConflictRaised {
                    project_id,
                    local_version,
                    remote_version,
                    pending_actions,
                    ..
                } = event
                {
                    callback(&ConflictNotice {
                        project_id: project_id.clone(),
                        local_version: *local_version,
                        remote_version: *remote_version,
                        pending_actions: *pending_actions,
                    });
                }
            })
            .await;
    }

    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.coordinator.pending_conflicts()
    }

    pub async fn resolve_conflict(&self, project_id: &str, strategy: ConflictStrategy) -> SyncOutcome<Project> {
        self.guarded(self.coordinator.resolve_conflict(project_id, strategy))
            .await
    }

    pub async fn conflict_history(&self, limit: usize) -> SyncOutcome<Vec<ConflictRecord>> {
        self.guarded(self.coordinator.conflict_history(limit)).await
    }

    // ========== 撤销/重做 ==========

    pub async fn undo(&self, project_id: &str) -> SyncOutcome<Project> {
        self.guarded(self.coordinator.undo(project_id)).await
    }

    pub async fn redo(&self, project_id: &str) -> SyncOutcome<Project> {
        self.guarded(self.coordinator.redo(project_id)).await
    }

    pub fn can_undo(&self, project_id: &str) -> bool {
        self.coordinator.can_undo(project_id)
    }

    pub fn can_redo(&self, project_id: &str) -> bool {
        self.coordinator.can_redo(project_id)
    }

    // ========== 死信 ==========

    pub fn dead_letters(&self) -> Vec<QueuedAction> {
        self.coordinator.dead_letters()
    }

    pub async fn retry_dead_letter(&self, action_id: &str) -> SyncOutcome<QueuedAction> {
        self.guarded(self.coordinator.retry_dead_letter(action_id)).await
    }

    pub async fn discard_dead_letter(&self, action_id: &str) -> SyncOutcome<QueuedAction> {
        self.guarded(self.coordinator.discard_dead_letter(action_id)).await
    }

    // ========== 连接 ==========

    /// 重置退避与熔断器并立即探测，返回是否连通
    pub async fn force_reconnect(&self) -> SyncOutcome<bool> {
        self.guarded(async {
            let online = self.reconnect.force_reconnect().await;
            if online {
                self.queue.wake_handle().notify_one();
            }
            Ok(online)
        })
        .await
    }

    // ========== 在线状态 ==========

    /// 处理在线状态通道收到的心跳
    pub async fn receive_heartbeat(&self, heartbeat: DeviceHeartbeat) -> bool {
        self.presence.record_heartbeat(heartbeat).await
    }

    pub async fn active_devices(&self) -> Vec<DeviceHeartbeat> {
        self.presence.active_devices().await
    }

    // ========== 数据导出 ==========

    /// 导出全部本地数据（JSON），存储降级时的人工兜底
    pub async fn export_data(&self) -> SyncOutcome<String> {
        self.guarded(async { self.coordinator.export_data() }).await
    }

    pub async fn stats(&self) -> SdkStats {
        SdkStats {
            queue: self.queue.stats(),
            breaker: self.breaker.stats(),
            reconnect: self.reconnect.stats(),
            presence: self.presence.stats().await,
            pending_conflicts: self.coordinator.pending_conflicts().len(),
            storage_degraded: self.storage.is_degraded(),
            storage_write_failures: self.storage.write_failures(),
        }
    }

    // ========== 生命周期 ==========

    /// 进入前台
    pub async fn enter_foreground(&self) -> Result<()> {
        self.check_initialized().await?;
        info!("应用进入前台");
        self.lifecycle.read().await.notify_foreground().await
    }

    /// 进入后台：提交去抖保存并写检查点
    pub async fn enter_background(&self) -> Result<()> {
        self.check_initialized().await?;
        info!("应用进入后台");
        self.lifecycle.read().await.notify_background().await
    }

    pub async fn register_lifecycle_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.lifecycle.write().await.register_hook(hook);
    }

    /// 关闭 SDK：停止后台任务，提交未完成的保存并写入检查点
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut shutting_down = self.shutting_down.write().await;
            if *shutting_down {
                return Ok(());
            }
            *shutting_down = true;
        }
        info!("正在关闭 FlowSyncSDK...");

        self.consumer.stop().await?;
        self.reconnect.stop();
        self.shutdown_token.cancel();

        let flushed = self.coordinator.flush_pending_saves().await;
        if flushed > 0 {
            debug!("关闭前提交 {} 个去抖保存", flushed);
        }
        if let Err(e) = self.coordinator.checkpoint_now().await {
            warn!("⚠️ 关闭前写入检查点失败: {}", e);
        }
        if let Err(e) = self.storage.flush().await {
            warn!("⚠️ 关闭前刷新存储失败: {}", e);
        }

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        *self.initialized.write().await = false;
        info!("FlowSyncSDK 关闭完成");
        Ok(())
    }
}
