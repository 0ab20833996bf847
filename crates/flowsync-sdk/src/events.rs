//! 事件系统模块 - 同步引擎内部与展示层之间的发布/订阅总线
//!
//! 功能包括：
//! - 队列事件（入队、成功、重试、死信、停滞）
//! - 快照事件（回滚、淘汰）
//! - 熔断器与连通性事件
//! - 冲突事件（检测、解决）
//! - 撤销/重做、存储降级、设备活跃等提示事件
//!
//! 组件之间不直接互相持有，而是通过事件总线解耦。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::network::circuit_breaker::BreakerState;
use crate::storage::entities::ConflictStrategy;
use crate::storage::queue::ActionKind;

/// 同步引擎事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    ActionEnqueued {
        project_id: String,
        action_id: String,
        kind: ActionKind,
        coalesced: bool,
        timestamp: i64,
    },
    ActionSucceeded {
        project_id: String,
        action_id: String,
        attempts: u32,
        version: i64,
        timestamp: i64,
    },
    ActionRetryScheduled {
        project_id: String,
        action_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: i64,
    },
    /// 重试耗尽或不可重试，需要用户手动重试或丢弃
    ActionDeadLettered {
        project_id: String,
        action_id: String,
        attempts: u32,
        reason: String,
        timestamp: i64,
    },
    /// 队列长时间没有消费者
    QueueStalled { pending: usize, timestamp: i64 },
    SnapshotRolledBack {
        project_id: String,
        snapshot_id: String,
        timestamp: i64,
    },
    SnapshotEvicted {
        project_id: String,
        snapshot_id: String,
        reason: String,
        timestamp: i64,
    },
    /// 快照已被淘汰，回滚无法执行
    RollbackUnavailable {
        project_id: Option<String>,
        snapshot_id: String,
        timestamp: i64,
    },
    BreakerStateChanged {
        old_state: BreakerState,
        new_state: BreakerState,
        timestamp: i64,
    },
    ConnectivityChanged { online: bool, timestamp: i64 },
    /// 远端不可用，使用本地数据
    WorkingOffline { reason: String, timestamp: i64 },
    ConflictRaised {
        project_id: String,
        local_version: i64,
        remote_version: i64,
        pending_actions: usize,
        timestamp: i64,
    },
    ConflictResolved {
        project_id: String,
        strategy: ConflictStrategy,
        timestamp: i64,
    },
    RemoteApplied {
        project_id: String,
        version: i64,
        timestamp: i64,
    },
    /// 项目正在编辑，远端推送暂存
    PushBuffered {
        project_id: String,
        version: i64,
        timestamp: i64,
    },
    UndoApplied { project_id: String, timestamp: i64 },
    RedoApplied { project_id: String, timestamp: i64 },
    /// 本地存储不可用，数据只在内存中，需要提示用户导出
    StorageDegraded { reason: String, timestamp: i64 },
    DeviceActivity {
        device_id: String,
        last_seen_at: i64,
        timestamp: i64,
    },
    CheckpointSaved { projects: usize, timestamp: i64 },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ActionEnqueued { .. } => "action_enqueued",
            SyncEvent::ActionSucceeded { .. } => "action_succeeded",
            SyncEvent::ActionRetryScheduled { .. } => "action_retry_scheduled",
            SyncEvent::ActionDeadLettered { .. } => "action_dead_lettered",
            SyncEvent::QueueStalled { .. } => "queue_stalled",
            SyncEvent::SnapshotRolledBack { .. } => "snapshot_rolled_back",
            SyncEvent::SnapshotEvicted { .. } => "snapshot_evicted",
            SyncEvent::RollbackUnavailable { .. } => "rollback_unavailable",
            SyncEvent::BreakerStateChanged { .. } => "breaker_state_changed",
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::WorkingOffline { .. } => "working_offline",
            SyncEvent::ConflictRaised { .. } => "conflict_raised",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::RemoteApplied { .. } => "remote_applied",
            SyncEvent::PushBuffered { .. } => "push_buffered",
            SyncEvent::UndoApplied { .. } => "undo_applied",
            SyncEvent::RedoApplied { .. } => "redo_applied",
            SyncEvent::StorageDegraded { .. } => "storage_degraded",
            SyncEvent::DeviceActivity { .. } => "device_activity",
            SyncEvent::CheckpointSaved { .. } => "checkpoint_saved",
        }
    }

    /// 获取事件关联的项目ID
    pub fn project_id(&self) -> Option<&str> {
        match self {
            SyncEvent::ActionEnqueued { project_id, .. }
            | SyncEvent::ActionSucceeded { project_id, .. }
            | SyncEvent::ActionRetryScheduled { project_id, .. }
            | SyncEvent::ActionDeadLettered { project_id, .. }
            | SyncEvent::SnapshotRolledBack { project_id, .. }
            | SyncEvent::SnapshotEvicted { project_id, .. }
            | SyncEvent::ConflictRaised { project_id, .. }
            | SyncEvent::ConflictResolved { project_id, .. }
            | SyncEvent::RemoteApplied { project_id, .. }
            | SyncEvent::PushBuffered { project_id, .. }
            | SyncEvent::UndoApplied { project_id, .. }
            | SyncEvent::RedoApplied { project_id, .. } => Some(project_id),
            SyncEvent::RollbackUnavailable { project_id, .. } => project_id.as_deref(),
            _ => None,
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ActionEnqueued { timestamp, .. }
            | SyncEvent::ActionSucceeded { timestamp, .. }
            | SyncEvent::ActionRetryScheduled { timestamp, .. }
            | SyncEvent::ActionDeadLettered { timestamp, .. }
            | SyncEvent::QueueStalled { timestamp, .. }
            | SyncEvent::SnapshotRolledBack { timestamp, .. }
            | SyncEvent::SnapshotEvicted { timestamp, .. }
            | SyncEvent::RollbackUnavailable { timestamp, .. }
            | SyncEvent::BreakerStateChanged { timestamp, .. }
            | SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::WorkingOffline { timestamp, .. }
            | SyncEvent::ConflictRaised { timestamp, .. }
            | SyncEvent::ConflictResolved { timestamp, .. }
            | SyncEvent::RemoteApplied { timestamp, .. }
            | SyncEvent::PushBuffered { timestamp, .. }
            | SyncEvent::UndoApplied { timestamp, .. }
            | SyncEvent::RedoApplied { timestamp, .. }
            | SyncEvent::StorageDegraded { timestamp, .. }
            | SyncEvent::DeviceActivity { timestamp, .. }
            | SyncEvent::CheckpointSaved { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 项目ID过滤器
    pub project_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_project_ids(mut self, project_ids: Vec<String>) -> Self {
        self.project_ids = Some(project_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref project_ids) = self.project_ids {
            match event.project_id() {
                Some(pid) if project_ids.iter().any(|p| p == pid) => {}
                // 事件没有项目ID但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }

        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`"*"` 监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
