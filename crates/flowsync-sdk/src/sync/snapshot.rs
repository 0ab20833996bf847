//! 乐观快照跟踪
//!
//! - 本地变更应用前捕获项目状态，作为回滚点
//! - 远端确认对应动作后丢弃
//! - 定期清理：超过最长保留时间的快照被淘汰，数量超过上限时淘汰最旧的
//! - 被淘汰的快照视为已持久，不能再回滚；对其回滚是空操作并给出警告

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::storage::entities::{Project, SnapshotRecord};
use crate::storage::StorageManager;
use crate::utils::time::now_millis;

/// 记住最近淘汰的快照，便于区分“已淘汰”和“从未存在”
const EVICTED_MEMORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    Capacity,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Capacity => "capacity",
        }
    }
}

/// 一次清理的结果
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub evicted: Vec<(SnapshotRecord, EvictionReason)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }

    pub fn count(&self) -> usize {
        self.evicted.len()
    }
}

/// 回滚结果
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    Restored(SnapshotRecord),
    /// 快照已被淘汰或不存在
    Unavailable { project_id: Option<String> },
}

#[derive(Debug, Default)]
struct TrackerInner {
    snapshots: HashMap<String, SnapshotRecord>,
    /// 捕获顺序，队首最旧
    order: VecDeque<String>,
    /// snapshot_id -> project_id
    evicted: VecDeque<(String, String)>,
}

impl TrackerInner {
    fn remove(&mut self, snapshot_id: &str) -> Option<SnapshotRecord> {
        let record = self.snapshots.remove(snapshot_id)?;
        self.order.retain(|id| id != snapshot_id);
        Some(record)
    }

    fn remember_evicted(&mut self, record: &SnapshotRecord) {
        if self.evicted.len() >= EVICTED_MEMORY {
            self.evicted.pop_front();
        }
        self.evicted.push_back((record.id.clone(), record.project_id.clone()));
    }
}

pub struct SnapshotTracker {
    config: SnapshotConfig,
    inner: Mutex<TrackerInner>,
    storage: Option<Arc<StorageManager>>,
}

impl SnapshotTracker {
    pub fn new(config: SnapshotConfig, storage: Option<Arc<StorageManager>>) -> Self {
        Self {
            config,
            inner: Mutex::new(TrackerInner::default()),
            storage,
        }
    }

    async fn persist_delete(&self, ids: &[String]) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete_snapshots(ids).await {
                storage.note_write_failure("删除快照", &e);
            }
        }
    }

    /// 捕获变更前状态，返回快照 ID
    ///
    /// 内存中的回滚点在函数返回前已经建立。
    pub async fn capture(&self, project_id: &str, prior_state: &Project) -> String {
        let record = SnapshotRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            prior_state: prior_state.clone(),
            created_at: now_millis(),
        };
        {
            let mut inner = self.inner.lock();
            inner.order.push_back(record.id.clone());
            inner.snapshots.insert(record.id.clone(), record.clone());
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_snapshot(&record).await {
                storage.note_write_failure("保存快照", &e);
            }
        }
        debug!("📸 捕获快照: project={}, snapshot={}", project_id, record.id);
        record.id
    }

    /// 远端确认后丢弃快照
    pub async fn discard(&self, snapshot_id: &str) -> bool {
        let removed = self.inner.lock().remove(snapshot_id).is_some();
        if removed {
            self.persist_delete(&[snapshot_id.to_string()]).await;
        }
        removed
    }

    /// 丢弃项目的全部快照（采用远端状态后）
    pub async fn discard_project(&self, project_id: &str) -> usize {
        let ids: Vec<String> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .snapshots
                .values()
                .filter(|s| s.project_id == project_id)
                .map(|s| s.id.clone())
                .collect();
            for id in &ids {
                inner.remove(id);
            }
            ids
        };
        self.persist_delete(&ids).await;
        ids.len()
    }

    /// 回滚：取出快照中的变更前状态，快照随之失效
    pub async fn rollback(&self, snapshot_id: &str) -> RollbackOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.remove(snapshot_id) {
                Some(record) => RollbackOutcome::Restored(record),
                None => RollbackOutcome::Unavailable {
                    project_id: inner
                        .evicted
                        .iter()
                        .find(|(id, _)| id == snapshot_id)
                        .map(|(_, pid)| pid.clone()),
                },
            }
        };
        match &outcome {
            RollbackOutcome::Restored(record) => {
                self.persist_delete(&[snapshot_id.to_string()]).await;
                info!("↩️ 回滚快照: project={}, snapshot={}", record.project_id, snapshot_id);
            }
            RollbackOutcome::Unavailable { project_id } => {
                warn!(
                    "⚠️ 快照 {} 已被淘汰或不存在（project={:?}），无法回滚，本地状态可能已与预期不一致",
                    snapshot_id, project_id
                );
            }
        }
        outcome
    }

    /// 清理过期快照并执行数量上限
    pub async fn sweep(&self, now: i64) -> SweepReport {
        let report = {
            let mut inner = self.inner.lock();
            let mut report = SweepReport::default();

            let expired: Vec<String> = inner
                .snapshots
                .values()
                .filter(|s| now - s.created_at > self.config.max_age_ms)
                .map(|s| s.id.clone())
                .collect();
            for id in expired {
                if let Some(record) = inner.remove(&id) {
                    inner.remember_evicted(&record);
                    report.evicted.push((record, EvictionReason::Expired));
                }
            }

            while inner.snapshots.len() > self.config.max_count {
                let Some(oldest) = inner.order.front().cloned() else {
                    break;
                };
                if let Some(record) = inner.remove(&oldest) {
                    inner.remember_evicted(&record);
                    report.evicted.push((record, EvictionReason::Capacity));
                }
            }
            report
        };

        if !report.is_empty() {
            let ids: Vec<String> = report.evicted.iter().map(|(r, _)| r.id.clone()).collect();
            self.persist_delete(&ids).await;
            info!("🧹 淘汰 {} 个快照", report.count());
        }
        report
    }

    /// 从持久化存储恢复
    pub async fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let mut records = storage.load_snapshots().await?;
        records.sort_by_key(|r| r.created_at);
        let mut inner = self.inner.lock();
        inner.snapshots.clear();
        inner.order.clear();
        for record in records {
            inner.order.push_back(record.id.clone());
            inner.snapshots.insert(record.id.clone(), record);
        }
        Ok(inner.snapshots.len())
    }

    pub fn contains(&self, snapshot_id: &str) -> bool {
        self.inner.lock().snapshots.contains_key(snapshot_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
