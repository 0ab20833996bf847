//! 集成测试共用的组装代码

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use flowsync_sdk::config::{BreakerConfig, ConflictConfig, RetryConfig, SnapshotConfig, SyncConfig, TimeoutConfig, UndoConfig};
use flowsync_sdk::events::{EventManager, SyncEvent};
use flowsync_sdk::network::{CircuitBreaker, NetworkMonitor};
use flowsync_sdk::storage::queue::{ActionQueue, Mutation, RetryPolicy, TextField};
use flowsync_sdk::storage::StorageManager;
use flowsync_sdk::sync::{CoordinatorParts, GuardedRemote, MemoryTransport, SnapshotTracker, SyncCoordinator};
use tokio::sync::broadcast;

pub struct Harness {
    pub coordinator: Arc<SyncCoordinator>,
    pub transport: Arc<MemoryTransport>,
    pub breaker: Arc<CircuitBreaker>,
    pub events: Arc<EventManager>,
    pub queue: Arc<ActionQueue>,
}

/// 立即重试、无抖动，便于逐轮驱动队列
pub fn instant_retry() -> RetryConfig {
    RetryConfig {
        initial_delay_ms: 0,
        jitter_factor: 0.0,
        ..RetryConfig::default()
    }
}

pub fn breaker_config(threshold: u32, open_ms: u64) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: threshold,
        open_duration_ms: open_ms,
        jitter_factor: 0.0,
        ..BreakerConfig::default()
    }
}

pub fn harness() -> Harness {
    build(BreakerConfig { jitter_factor: 0.0, ..BreakerConfig::default() }, None)
}

pub fn build(breaker: BreakerConfig, storage: Option<Arc<StorageManager>>) -> Harness {
    build_with_transport(Arc::new(MemoryTransport::new()), breaker, storage)
}

pub fn build_with_transport(
    transport: Arc<MemoryTransport>,
    breaker: BreakerConfig,
    storage: Option<Arc<StorageManager>>,
) -> Harness {
    let breaker = Arc::new(CircuitBreaker::new(breaker));
    let events = Arc::new(EventManager::new(256));
    let queue = Arc::new(ActionQueue::new(RetryPolicy::from(&instant_retry()), storage.clone()));
    let parts = CoordinatorParts {
        queue: queue.clone(),
        snapshots: Arc::new(SnapshotTracker::new(SnapshotConfig::default(), storage.clone())),
        remote: Arc::new(GuardedRemote::new(
            transport.clone(),
            breaker.clone(),
            TimeoutConfig::default(),
        )),
        events: events.clone(),
        network: Arc::new(NetworkMonitor::new()),
        storage,
    };
    let coordinator = SyncCoordinator::new(
        SyncConfig::default(),
        ConflictConfig::default(),
        UndoConfig::default(),
        parts,
    );
    Harness {
        coordinator,
        transport,
        breaker,
        events,
        queue,
    }
}

pub async fn open_storage(dir: &Path, user_id: &str) -> Arc<StorageManager> {
    let storage = StorageManager::new(dir).await.unwrap();
    storage.init_user(user_id).await.unwrap();
    Arc::new(storage)
}

pub fn rename(name: &str, updated_at: i64) -> Mutation {
    Mutation::RenameProject {
        name: name.into(),
        updated_at,
    }
}

pub fn edit_title(task_id: &str, text: &str, updated_at: i64) -> Mutation {
    Mutation::EditTaskText {
        task_id: task_id.into(),
        field: TextField::Title,
        text: text.into(),
        updated_at,
    }
}

/// 取出当前已到达的全部事件
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
