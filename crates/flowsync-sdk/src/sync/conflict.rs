//! 冲突检测与解决记录
//!
//! 检测以版本号为主要信号：远端版本超过本地基线即说明有其他设备写入。
//! 只有本地存在待同步动作时，远端前进才构成冲突；否则直接采用远端。
//! 版本没有前进时，更新时间领先超过阈值也视为冲突（时钟信号只作补充）。
//!
//! 每个冲突只会被解决一次：解决开始时先写审计记录，再从待解决集合中移除。
//! 未解决的冲突写入本地数据库，重启后恢复，期间该项目不会发起推送。

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ConflictConfig;
use crate::error::{FlowSyncError, Result};
use crate::storage::entities::{ConflictRecord, ConflictStrategy, Project, SyncBaseline};

pub use crate::storage::entities::PendingConflict;
use crate::storage::StorageManager;
use crate::utils::time::now_millis;

/// 检测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// 远端与基线一致
    Unchanged,
    /// 远端比基线旧（乱序推送），忽略
    Stale,
    /// 没有待同步动作，直接采用远端
    Apply,
    /// 远端小幅前进，在远端上重放待同步动作
    Rebase,
    Conflict { local_version: i64, remote_version: i64 },
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, baseline: Option<SyncBaseline>, remote: &Project, pending: usize) -> Detection {
        let Some(baseline) = baseline else {
            return if pending == 0 { Detection::Apply } else { Detection::Rebase };
        };

        let delta = remote.version - baseline.version;
        if delta < 0 {
            return Detection::Stale;
        }
        if delta == 0 {
            let clock_ahead = remote.updated_at - baseline.updated_at > self.config.time_threshold_ms;
            return if clock_ahead && pending > 0 {
                Detection::Conflict {
                    local_version: baseline.version,
                    remote_version: remote.version,
                }
            } else {
                Detection::Unchanged
            };
        }
        if pending == 0 {
            return Detection::Apply;
        }
        if delta > self.config.version_tolerance {
            Detection::Conflict {
                local_version: baseline.version,
                remote_version: remote.version,
            }
        } else {
            Detection::Rebase
        }
    }
}

/// 冲突登记与解决
pub struct ConflictResolver {
    config: ConflictConfig,
    pending: Mutex<HashMap<String, PendingConflict>>,
    /// 没有持久化存储时的历史记录（最新在前）
    history: Mutex<VecDeque<ConflictRecord>>,
    storage: Option<Arc<StorageManager>>,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig, storage: Option<Arc<StorageManager>>) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            storage,
        }
    }

    /// 登记冲突，返回是否为新冲突
    ///
    /// 同一项目已有未解决冲突时只更新远端状态。
    pub async fn raise(&self, conflict: PendingConflict) -> bool {
        let (is_new, stored) = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&conflict.project_id) {
                Some(existing) => {
                    existing.remote_version = conflict.remote_version;
                    existing.remote = conflict.remote;
                    existing.pending_actions = conflict.pending_actions;
                    (false, existing.clone())
                }
                None => {
                    warn!(
                        "⚠️ 检测到冲突: project={}, local=v{}, remote=v{}, pending={}",
                        conflict.project_id,
                        conflict.local_version,
                        conflict.remote_version,
                        conflict.pending_actions
                    );
                    pending.insert(conflict.project_id.clone(), conflict.clone());
                    (true, conflict)
                }
            }
        };
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_pending_conflict(&stored).await {
                storage.note_write_failure("保存待解决冲突", &e);
            }
        }
        is_new
    }

    /// 从本地数据库恢复未解决的冲突，返回恢复数量
    pub async fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let restored = storage.load_pending_conflicts().await?;
        let mut pending = self.pending.lock();
        let mut count = 0;
        for conflict in restored {
            if !pending.contains_key(&conflict.project_id) {
                pending.insert(conflict.project_id.clone(), conflict);
                count += 1;
            }
        }
        if count > 0 {
            info!("🔄 恢复 {} 个未解决的冲突", count);
        }
        Ok(count)
    }

    pub fn has_pending(&self, project_id: &str) -> bool {
        self.pending.lock().contains_key(project_id)
    }

    pub fn pending(&self, project_id: &str) -> Option<PendingConflict> {
        self.pending.lock().get(project_id).cloned()
    }

    pub fn pending_all(&self) -> Vec<PendingConflict> {
        let mut all: Vec<PendingConflict> = self.pending.lock().values().cloned().collect();
        all.sort_by(|a, b| a.raised_at.cmp(&b.raised_at));
        all
    }

    /// 开始解决：写入审计记录并移除待解决冲突
    ///
    /// 审计记录在任何状态变更之前写入；写入失败只记录，不阻止解决。
    pub async fn begin_resolution(
        &self,
        project_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<PendingConflict> {
        let conflict = self.pending.lock().remove(project_id).ok_or_else(|| {
            FlowSyncError::InvalidOperation(format!("项目 {} 没有待解决的冲突", project_id))
        })?;

        let record = ConflictRecord {
            id: conflict.id.clone(),
            project_id: project_id.to_string(),
            local_version: conflict.local_version,
            remote_version: conflict.remote_version,
            resolution: strategy,
            timestamp: now_millis(),
            archived: false,
        };
        match &self.storage {
            Some(storage) => {
                if let Err(e) = storage.resolve_pending_conflict(&record).await {
                    storage.note_write_failure("写入冲突记录", &e);
                    self.remember(record);
                }
            }
            None => self.remember(record),
        }
        info!("冲突解决开始: project={}, strategy={}", project_id, strategy.as_str());
        Ok(conflict)
    }

    fn remember(&self, record: ConflictRecord) {
        let mut history = self.history.lock();
        history.push_front(record);
        history.truncate(self.config.history_max_count.max(1));
    }

    /// 最近的解决记录（最新在前）
    pub async fn history(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        let mut records = match &self.storage {
            Some(storage) => storage.conflict_history(limit).await?,
            None => Vec::new(),
        };
        records.extend(self.history.lock().iter().cloned());
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    /// 归档过期记录并执行条数上限
    pub async fn archive(&self, now: i64) -> Result<usize> {
        let cutoff = now - self.config.archive_after_ms;
        let memory = {
            let mut history = self.history.lock();
            let before = history.len();
            history.retain(|r| r.timestamp >= cutoff);
            before - history.len()
        };
        let persisted = match &self.storage {
            Some(storage) => {
                storage
                    .archive_conflicts(cutoff, self.config.history_max_count)
                    .await?
            }
            None => 0,
        };
        Ok(memory + persisted)
    }
}
