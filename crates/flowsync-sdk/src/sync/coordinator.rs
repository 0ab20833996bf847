//! 同步协调器
//!
//! 协调器是本地项目状态的唯一写入方，负责：
//! - 本地变更：校验 → 捕获快照 → 更新本地状态 → 入队
//! - 去抖保存：同一项目在去抖窗口内的整项目保存合并为一个动作
//! - 队列消费：按项目并发执行，同一项目严格串行；确认后推进基线
//! - 远端推送：编辑锁期间暂存，否则交给冲突检测
//! - 云端加载与重连合并：对账本地与远端项目列表，失败时回退到本地检查点
//! - 冲突解决、撤销/重做、检查点
//!
//! 同一项目的状态修改通过项目级互斥锁串行化；远端调用期间不持有该锁。

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::conflict::{ConflictDetector, ConflictResolver, Detection, PendingConflict};
use super::editing_lock::EditingLocks;
use super::merge::{merge_projects, rebase, reconcile_project};
use super::remote::GuardedRemote;
use super::snapshot::{RollbackOutcome, SnapshotTracker};
use super::transport::RemoteAck;
use super::undo::UndoGuard;
use crate::config::{ConflictConfig, SyncConfig, UndoConfig};
use crate::error::{FlowSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::storage::entities::{ConflictRecord, ConflictStrategy, Project, SyncBaseline};
use crate::storage::kv::keys;
use crate::storage::queue::{ActionQueue, DrainTarget, FailureOutcome, Mutation, QueuedAction};
use crate::storage::StorageManager;
use crate::utils::time::now_millis;
use crate::utils::{DeferredTask, StateContainer};
use crate::version::{version_info, VersionInfo};

/// 云端加载结果
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub projects: Vec<Project>,
    /// 远端不可用，结果来自本地
    pub offline: bool,
}

/// 远端推送的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// 项目正在编辑或有动作在途，已暂存
    Buffered,
    Applied,
    Rebased,
    ConflictRaised,
    Ignored,
}

/// 数据导出（本地存储不可用时的人工兜底）
#[derive(Debug, Serialize)]
pub struct ExportDocument {
    pub exported_at: String,
    pub sdk: VersionInfo,
    pub projects: Vec<Project>,
    pub pending_actions: Vec<QueuedAction>,
    pub dead_letters: Vec<QueuedAction>,
}

/// 协调器依赖的组件
pub struct CoordinatorParts {
    pub queue: Arc<ActionQueue>,
    pub snapshots: Arc<SnapshotTracker>,
    pub remote: Arc<GuardedRemote>,
    pub events: Arc<EventManager>,
    pub network: Arc<NetworkMonitor>,
    pub storage: Option<Arc<StorageManager>>,
}

pub struct SyncCoordinator {
    me: Weak<SyncCoordinator>,
    config: SyncConfig,
    queue: Arc<ActionQueue>,
    snapshots: Arc<SnapshotTracker>,
    remote: Arc<GuardedRemote>,
    events: Arc<EventManager>,
    network: Arc<NetworkMonitor>,
    storage: Option<Arc<StorageManager>>,
    detector: ConflictDetector,
    conflicts: ConflictResolver,
    undo: UndoGuard,
    projects: StateContainer<HashMap<String, Project>>,
    baselines: Mutex<HashMap<String, SyncBaseline>>,
    /// 项目被外部推进的累计版本数（撤销保护用）
    remote_advances: Mutex<HashMap<String, i64>>,
    project_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    debouncers: Mutex<HashMap<String, Arc<DeferredTask>>>,
    pending_saves: Mutex<HashMap<String, Project>>,
    editing: EditingLocks,
    released: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        conflict: ConflictConfig,
        undo: UndoConfig,
        parts: CoordinatorParts,
    ) -> Arc<Self> {
        let (editing, released) = EditingLocks::new(config.editing_lock_timeout());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            detector: ConflictDetector::new(conflict.clone()),
            conflicts: ConflictResolver::new(conflict, parts.storage.clone()),
            undo: UndoGuard::new(undo),
            queue: parts.queue,
            snapshots: parts.snapshots,
            remote: parts.remote,
            events: parts.events,
            network: parts.network,
            storage: parts.storage,
            projects: StateContainer::default(),
            baselines: Mutex::new(HashMap::new()),
            remote_advances: Mutex::new(HashMap::new()),
            project_locks: Mutex::new(HashMap::new()),
            debouncers: Mutex::new(HashMap::new()),
            pending_saves: Mutex::new(HashMap::new()),
            editing,
            released: Mutex::new(Some(released)),
        })
    }

    fn project_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.project_locks
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    // ========== 状态读取 ==========

    /// 未删除的项目，按 ID 排序
    pub fn projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> =
            self.projects.read(|m| m.values().filter(|p| !p.deleted).cloned().collect());
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.projects.read(|m| m.get(project_id).cloned())
    }

    /// 项目状态容器，展示层可订阅修订号
    pub fn state(&self) -> &StateContainer<HashMap<String, Project>> {
        &self.projects
    }

    pub fn baseline(&self, project_id: &str) -> Option<SyncBaseline> {
        self.baselines.lock().get(project_id).copied()
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn snapshots(&self) -> &Arc<SnapshotTracker> {
        &self.snapshots
    }

    pub fn can_undo(&self, project_id: &str) -> bool {
        self.undo.can_undo(project_id)
    }

    pub fn can_redo(&self, project_id: &str) -> bool {
        self.undo.can_redo(project_id)
    }

    fn remote_advance(&self, project_id: &str) -> i64 {
        self.remote_advances.lock().get(project_id).copied().unwrap_or(0)
    }

    /// 累加外部写入推进的版本数，本设备自己的确认不计入
    fn note_remote_advance(&self, project_id: &str, baseline: Option<SyncBaseline>, remote_version: i64) {
        let Some(baseline) = baseline else {
            return;
        };
        let delta = remote_version - baseline.version;
        if delta > 0 {
            *self.remote_advances.lock().entry(project_id.to_string()).or_insert(0) += delta;
        }
    }

    fn set_project(&self, project: Project) {
        self.projects.update(|m| m.insert(project.id.clone(), project));
    }

    /// 基线只前进
    async fn set_baseline(&self, project_id: &str, baseline: SyncBaseline) {
        let updated = {
            let mut baselines = self.baselines.lock();
            match baselines.get(project_id) {
                Some(existing) if existing.version > baseline.version => false,
                _ => {
                    baselines.insert(project_id.to_string(), baseline);
                    true
                }
            }
        };
        if !updated {
            return;
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_baseline(project_id, &baseline).await {
                storage.note_write_failure("保存同步基线", &e);
            }
        }
    }

    fn pending_mutations(&self, project_id: &str) -> Vec<Mutation> {
        self.queue
            .pending_actions(project_id)
            .into_iter()
            .map(|a| a.payload)
            .collect()
    }

    // ========== 本地变更 ==========

    /// 提交一次本地变更，返回承载它的动作 ID
    pub async fn apply_mutation(&self, project_id: &str, mutation: Mutation, coalescible: bool) -> Result<String> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        if self.editing.is_locked(project_id) {
            self.editing.touch(project_id);
        }
        self.commit_locked(project_id, mutation, coalescible, true).await
    }

    /// 调用方必须持有项目锁
    async fn commit_locked(
        &self,
        project_id: &str,
        mutation: Mutation,
        coalescible: bool,
        record_undo: bool,
    ) -> Result<String> {
        mutation.validate(project_id)?;

        let existing = self.project(project_id);
        let prior = existing
            .clone()
            .unwrap_or_else(|| Project::new(project_id, project_id, mutation.timestamp()));
        let mut next = prior.clone();
        mutation.apply(&mut next)?;

        // 回滚点必须先于本地状态建立
        let snapshot_id = self.snapshots.capture(project_id, &prior).await;
        self.set_project(next.clone());

        let kind = mutation.kind();
        let mut action = QueuedAction::new(project_id, mutation).with_snapshot(&snapshot_id);
        if coalescible {
            action = action.coalescible();
        }
        let outcome = match self.queue.enqueue(action).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.projects.update(|m| match existing {
                    Some(project) => {
                        m.insert(project_id.to_string(), project);
                    }
                    None => {
                        m.remove(project_id);
                    }
                });
                self.snapshots.discard(&snapshot_id).await;
                return Err(e);
            }
        };
        if let Some(superseded) = &outcome.superseded_snapshot {
            self.snapshots.discard(superseded).await;
        }
        if record_undo {
            self.undo
                .record(project_id, prior, next, self.remote_advance(project_id));
        }

        self.events
            .emit(SyncEvent::ActionEnqueued {
                project_id: project_id.to_string(),
                action_id: outcome.action_id.clone(),
                kind,
                coalesced: outcome.coalesced,
                timestamp: now_millis(),
            })
            .await;
        Ok(outcome.action_id)
    }

    /// 去抖保存整个项目
    ///
    /// 窗口内的多次保存只有最后一次生效，在窗口结束时作为一个可合并动作入队。
    pub fn save_project(&self, project: Project) {
        let project_id = project.id.clone();
        self.pending_saves.lock().insert(project_id.clone(), project);

        let debouncer = self
            .debouncers
            .lock()
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(DeferredTask::new(format!("save:{}", project_id))))
            .clone();
        let me = self.me.clone();
        debouncer.arm(self.config.debounce(), async move {
            let Some(coordinator) = me.upgrade() else {
                return;
            };
            // 在独立任务中执行，重新计时不会打断进行中的保存
            tokio::spawn(async move {
                if let Err(e) = coordinator.flush_save(&project_id).await {
                    warn!("⚠️ 去抖保存失败: project={}, error={}", project_id, e);
                }
            });
        });
    }

    async fn flush_save(&self, project_id: &str) -> Result<Option<String>> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let Some(project) = self.pending_saves.lock().remove(project_id) else {
            return Ok(None);
        };
        self.commit_locked(project_id, Mutation::SaveProject(project), true, true)
            .await
            .map(Some)
    }

    /// 立即执行所有尚未触发的去抖保存
    pub async fn flush_pending_saves(&self) -> usize {
        let debouncers: Vec<Arc<DeferredTask>> = self.debouncers.lock().values().cloned().collect();
        for debouncer in debouncers {
            debouncer.cancel();
        }
        let project_ids: Vec<String> = self.pending_saves.lock().keys().cloned().collect();
        let mut flushed = 0;
        for project_id in project_ids {
            match self.flush_save(&project_id).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(e) => warn!("⚠️ 保存失败: project={}, error={}", project_id, e),
            }
        }
        flushed
    }

    pub fn has_pending_save(&self, project_id: &str) -> bool {
        self.pending_saves.lock().contains_key(project_id)
    }

    // ========== 队列消费 ==========

    /// 执行所有到期的动作，返回处理的动作数
    pub async fn drain_once(&self) -> usize {
        let ready: Vec<String> = self
            .queue
            .ready_projects(now_millis())
            .into_iter()
            .filter(|pid| !self.conflicts.has_pending(pid))
            .collect();
        if ready.is_empty() {
            return 0;
        }
        let counts = join_all(ready.iter().map(|pid| self.drain_project(pid))).await;
        counts.into_iter().sum()
    }

    async fn drain_project(&self, project_id: &str) -> usize {
        let mut processed = 0;
        while let Some(action) = self.queue.next_ready(project_id, now_millis()) {
            if self.conflicts.has_pending(project_id) {
                let _ = self.queue.release(&action.id);
                break;
            }
            match self.remote.apply_action(&action).await {
                Ok(ack) => {
                    self.on_action_success(&action, ack).await;
                    processed += 1;
                }
                Err(FlowSyncError::BreakerOpen { retry_after_ms }) => {
                    // 熔断期间动作保持待执行，不消耗重试次数
                    debug!("熔断器打开，暂停项目 {} 的同步 ({}ms)", project_id, retry_after_ms);
                    let _ = self.queue.release(&action.id);
                    break;
                }
                Err(e) => {
                    processed += 1;
                    if !self.on_action_failure(&action, &e).await {
                        break;
                    }
                }
            }
        }
        processed
    }

    async fn on_action_success(&self, action: &QueuedAction, ack: RemoteAck) {
        let project_id = action.project_id.as_str();
        {
            let lock = self.project_lock(project_id);
            let _guard = lock.lock().await;
            let acked = match self.queue.ack_success(&action.id).await {
                Ok(acked) => acked,
                Err(e) => {
                    warn!("⚠️ 确认动作失败: {}", e);
                    return;
                }
            };
            if let Some(snapshot_id) = &acked.snapshot_id {
                self.snapshots.discard(snapshot_id).await;
            }
            self.set_baseline(
                project_id,
                SyncBaseline {
                    version: ack.version,
                    updated_at: ack.updated_at,
                },
            )
            .await;
            self.projects.update(|m| {
                if let Some(project) = m.get_mut(project_id) {
                    project.advance_version(ack.version);
                }
            });
        }

        self.network.set_status(NetworkStatus::Online).await;
        self.events
            .emit(SyncEvent::ActionSucceeded {
                project_id: project_id.to_string(),
                action_id: action.id.clone(),
                attempts: action.attempt,
                version: ack.version,
                timestamp: now_millis(),
            })
            .await;

        if let Err(e) = self.replay_buffered(project_id).await {
            warn!("⚠️ 处理暂存推送失败: project={}, error={}", project_id, e);
        }
    }

    /// 返回是否可以继续处理该项目的下一个动作
    async fn on_action_failure(&self, action: &QueuedAction, error: &FlowSyncError) -> bool {
        match self.queue.ack_failure(&action.id, error).await {
            Ok(FailureOutcome::RetryScheduled { action, delay }) => {
                self.events
                    .emit(SyncEvent::ActionRetryScheduled {
                        project_id: action.project_id.clone(),
                        action_id: action.id.clone(),
                        attempt: action.attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                false
            }
            Ok(FailureOutcome::DeadLettered { action, reason }) => {
                self.events
                    .emit(SyncEvent::ActionDeadLettered {
                        project_id: action.project_id.clone(),
                        action_id: action.id.clone(),
                        attempts: action.attempt,
                        reason,
                        timestamp: now_millis(),
                    })
                    .await;
                self.roll_back_dead_letter(&action).await;
                true
            }
            Err(e) => {
                warn!("⚠️ 处理动作失败结果出错: {}", e);
                false
            }
        }
    }

    /// 死信动作回滚：恢复快照，再重放项目剩余的待同步变更
    async fn roll_back_dead_letter(&self, action: &QueuedAction) {
        let Some(snapshot_id) = &action.snapshot_id else {
            return;
        };
        let project_id = action.project_id.as_str();
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        match self.snapshots.rollback(snapshot_id).await {
            RollbackOutcome::Restored(record) => {
                let remaining = self.pending_mutations(project_id);
                let mut rebuilt = rebase(&record.prior_state, remaining.iter());
                if let Some(current) = self.project(project_id) {
                    rebuilt.advance_version(current.version);
                }
                self.set_project(rebuilt);
                self.events
                    .emit(SyncEvent::SnapshotRolledBack {
                        project_id: project_id.to_string(),
                        snapshot_id: snapshot_id.clone(),
                        timestamp: now_millis(),
                    })
                    .await;
            }
            RollbackOutcome::Unavailable { project_id } => {
                self.events
                    .emit(SyncEvent::RollbackUnavailable {
                        project_id,
                        snapshot_id: snapshot_id.clone(),
                        timestamp: now_millis(),
                    })
                    .await;
            }
        }
    }

    // ========== 死信 ==========

    pub fn dead_letters(&self) -> Vec<QueuedAction> {
        self.queue.dead_letters()
    }

    /// 手动重试死信动作：重新排到队尾，并把变更重新应用到本地状态
    ///
    /// 进入死信时本地已回滚，重试不再捕获新的快照。
    pub async fn retry_dead_letter(&self, action_id: &str) -> Result<QueuedAction> {
        let project_id = self
            .queue
            .dead_letters()
            .into_iter()
            .find(|a| a.id == action_id)
            .map(|a| a.project_id)
            .ok_or_else(|| FlowSyncError::NotFound(format!("死信动作 {}", action_id)))?;
        let lock = self.project_lock(&project_id);
        let _guard = lock.lock().await;

        let action = self.queue.retry_dead_letter(action_id).await?;
        if let Some(mut project) = self.project(&project_id) {
            match action.payload.apply(&mut project) {
                Ok(()) => self.set_project(project),
                Err(e) => warn!("⚠️ 重试的死信动作无法应用到本地: action={}, error={}", action_id, e),
            }
        }
        Ok(action)
    }

    pub async fn discard_dead_letter(&self, action_id: &str) -> Result<QueuedAction> {
        self.queue.discard_dead_letter(action_id).await
    }

    // ========== 远端推送 ==========

    /// 处理远端推送
    pub async fn handle_remote_push(&self, project: Project) -> Result<PushOutcome> {
        let project_id = project.id.clone();
        if self.editing.is_locked(&project_id) {
            return Ok(self.buffer_push(project).await);
        }
        let lock = self.project_lock(&project_id);
        let _guard = lock.lock().await;
        self.intake_locked(project).await
    }

    async fn buffer_push(&self, project: Project) -> PushOutcome {
        let project_id = project.id.clone();
        let version = project.version;
        if self.editing.buffer(project) {
            debug!("📥 暂存远端推送: project={}, v{}", project_id, version);
            self.events
                .emit(SyncEvent::PushBuffered {
                    project_id,
                    version,
                    timestamp: now_millis(),
                })
                .await;
        }
        PushOutcome::Buffered
    }

    /// 调用方必须持有项目锁
    async fn intake_locked(&self, remote: Project) -> Result<PushOutcome> {
        let project_id = remote.id.clone();
        // 在途动作的确认可能就是这次推送，等确认后再判断
        if self.queue.has_in_flight(&project_id) {
            return Ok(self.buffer_push(remote).await);
        }

        let pending = self.queue.pending_count(&project_id);
        let baseline = self.baseline(&project_id);
        if self.conflicts.has_pending(&project_id) {
            self.raise_conflict(remote, baseline, pending).await;
            return Ok(PushOutcome::ConflictRaised);
        }

        match self.detector.detect(baseline, &remote, pending) {
            Detection::Unchanged | Detection::Stale => Ok(PushOutcome::Ignored),
            Detection::Apply => {
                let version = remote.version;
                self.note_remote_advance(&project_id, baseline, version);
                self.set_baseline(&project_id, SyncBaseline::of(&remote)).await;
                self.set_project(remote);
                self.emit_remote_applied(&project_id, version).await;
                Ok(PushOutcome::Applied)
            }
            Detection::Rebase => {
                let mut rebased = rebase(&remote, self.pending_mutations(&project_id).iter());
                if let Some(local) = self.project(&project_id) {
                    rebased.advance_version(local.version);
                }
                self.note_remote_advance(&project_id, baseline, remote.version);
                self.set_baseline(&project_id, SyncBaseline::of(&remote)).await;
                self.set_project(rebased);
                self.queue.requeue_project(&project_id).await;
                self.emit_remote_applied(&project_id, remote.version).await;
                Ok(PushOutcome::Rebased)
            }
            Detection::Conflict { .. } => {
                self.raise_conflict(remote, baseline, pending).await;
                Ok(PushOutcome::ConflictRaised)
            }
        }
    }

    async fn emit_remote_applied(&self, project_id: &str, version: i64) {
        self.events
            .emit(SyncEvent::RemoteApplied {
                project_id: project_id.to_string(),
                version,
                timestamp: now_millis(),
            })
            .await;
    }

    async fn raise_conflict(&self, remote: Project, baseline: Option<SyncBaseline>, pending: usize) {
        let project_id = remote.id.clone();
        let local = self.project(&project_id).unwrap_or_else(|| remote.clone());
        let local_version = baseline.map(|b| b.version).unwrap_or(local.version);
        let remote_version = remote.version;
        let is_new = self.conflicts.raise(PendingConflict {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.clone(),
            local,
            remote,
            local_version,
            remote_version,
            pending_actions: pending,
            raised_at: now_millis(),
        })
        .await;
        if is_new {
            self.events
                .emit(SyncEvent::ConflictRaised {
                    project_id,
                    local_version,
                    remote_version,
                    pending_actions: pending,
                    timestamp: now_millis(),
                })
                .await;
        }
    }

    /// 处理暂存的推送（编辑锁已释放且没有在途动作时）
    pub async fn replay_buffered(&self, project_id: &str) -> Result<Option<PushOutcome>> {
        if self.editing.is_locked(project_id) {
            return Ok(None);
        }
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        if self.queue.has_in_flight(project_id) {
            return Ok(None);
        }
        match self.editing.take_buffered(project_id) {
            Some(project) => self.intake_locked(project).await.map(Some),
            None => Ok(None),
        }
    }

    // ========== 编辑锁 ==========

    /// 获取或续期编辑锁（聚焦、输入时调用）
    pub fn begin_editing(&self, project_id: &str) {
        self.editing.touch(project_id);
    }

    /// 释放编辑锁并处理暂存的推送
    pub async fn end_editing(&self, project_id: &str) -> Result<Option<PushOutcome>> {
        self.editing.release(project_id);
        self.replay_buffered(project_id).await
    }

    pub fn is_editing(&self, project_id: &str) -> bool {
        self.editing.is_locked(project_id)
    }

    /// 启动编辑锁超时后的推送重放循环
    pub fn start_push_replay(&self) -> Option<JoinHandle<()>> {
        let mut released = self.released.lock().take()?;
        let me = self.me.clone();
        Some(tokio::spawn(async move {
            while let Some(project_id) = released.recv().await {
                let Some(coordinator) = me.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.replay_buffered(&project_id).await {
                    warn!("⚠️ 重放暂存推送失败: project={}, error={}", project_id, e);
                }
            }
        }))
    }

    // ========== 冲突 ==========

    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.conflicts.pending_all()
    }

    pub fn has_conflict(&self, project_id: &str) -> bool {
        self.conflicts.has_pending(project_id)
    }

    pub async fn conflict_history(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.conflicts.history(limit).await
    }

    pub async fn archive_conflicts(&self) -> Result<usize> {
        self.conflicts.archive(now_millis()).await
    }

    /// 按策略解决冲突，返回解决后的本地项目
    #[instrument(skip(self))]
    pub async fn resolve_conflict(&self, project_id: &str, strategy: ConflictStrategy) -> Result<Project> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let conflict = self.conflicts.begin_resolution(project_id, strategy).await?;
        let remote = conflict.remote.clone();
        let local = self.project(project_id).unwrap_or_else(|| conflict.local.clone());

        self.note_remote_advance(project_id, self.baseline(project_id), remote.version);
        self.set_baseline(project_id, SyncBaseline::of(&remote)).await;

        match strategy {
            ConflictStrategy::Local => {
                self.queue.requeue_project(project_id).await;
                let mut kept = local;
                kept.advance_version(remote.version);
                self.set_project(kept.clone());
                self.commit_locked(project_id, Mutation::SaveProject(kept), false, false)
                    .await?;
            }
            ConflictStrategy::Remote => {
                self.discard_local_work(project_id).await;
                self.undo.clear_project(project_id);
                self.set_project(remote);
            }
            ConflictStrategy::Merge => {
                let merged = merge_projects(&local, &remote);
                self.discard_local_work(project_id).await;
                self.commit_locked(project_id, Mutation::SaveProject(merged), false, true)
                    .await?;
            }
        }

        info!("✅ 冲突已解决: project={}, strategy={}", project_id, strategy.as_str());
        self.events
            .emit(SyncEvent::ConflictResolved {
                project_id: project_id.to_string(),
                strategy,
                timestamp: now_millis(),
            })
            .await;
        self.project(project_id)
            .ok_or_else(|| FlowSyncError::NotFound(format!("项目 {}", project_id)))
    }

    async fn discard_local_work(&self, project_id: &str) {
        self.queue.clear_project(project_id).await;
        self.snapshots.discard_project(project_id).await;
        self.pending_saves.lock().remove(project_id);
        if let Some(debouncer) = self.debouncers.lock().get(project_id) {
            debouncer.cancel();
        }
    }

    // ========== 撤销/重做 ==========

    pub async fn undo(&self, project_id: &str) -> Result<Project> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let restored = self.undo.undo(project_id, self.remote_advance(project_id))?;
        self.commit_restore(project_id, restored).await?;
        self.events
            .emit(SyncEvent::UndoApplied {
                project_id: project_id.to_string(),
                timestamp: now_millis(),
            })
            .await;
        self.project(project_id)
            .ok_or_else(|| FlowSyncError::NotFound(format!("项目 {}", project_id)))
    }

    pub async fn redo(&self, project_id: &str) -> Result<Project> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let restored = self.undo.redo(project_id, self.remote_advance(project_id))?;
        self.commit_restore(project_id, restored).await?;
        self.events
            .emit(SyncEvent::RedoApplied {
                project_id: project_id.to_string(),
                timestamp: now_millis(),
            })
            .await;
        self.project(project_id)
            .ok_or_else(|| FlowSyncError::NotFound(format!("项目 {}", project_id)))
    }

    /// 撤销/重做与普通编辑走同一条变更路径
    async fn commit_restore(&self, project_id: &str, mut restored: Project) -> Result<String> {
        if let Some(current) = self.project(project_id) {
            restored.version = current.version;
        }
        restored.updated_at = now_millis().max(restored.updated_at);
        self.commit_locked(project_id, Mutation::SaveProject(restored), false, false)
            .await
    }

    // ========== 加载与对账 ==========

    /// 云端加载，远端不可用时回退到本地数据
    #[instrument(skip(self))]
    pub async fn load(&self, user_id: &str) -> Result<LoadResult> {
        let limit = self.config.cloud_load_timeout();
        let result = match tokio::time::timeout(limit, self.remote.load_projects(user_id)).await {
            Ok(result) => result,
            Err(_) => {
                self.remote.breaker().record_failure();
                Err(FlowSyncError::Timeout(format!(
                    "cloud load exceeded {}ms",
                    limit.as_millis()
                )))
            }
        };

        match result {
            Ok(remote_projects) => {
                let count = remote_projects.len();
                let projects = self.reconcile_with_remote(remote_projects).await;
                self.network.set_status(NetworkStatus::Online).await;
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.set_marker(keys::LAST_REMOTE_LOAD, now_millis()).await {
                        storage.note_write_failure("记录加载时间", &e);
                    }
                }
                info!("✅ 云端加载完成: remote={}, local={}", count, projects.len());
                Ok(LoadResult { projects, offline: false })
            }
            Err(e) if e.is_retryable() => {
                warn!("⚠️ 云端加载失败，使用本地数据: {}", e);
                if self.projects.read(|m| m.is_empty()) {
                    if let Err(restore_err) = self.restore_checkpoints().await {
                        warn!("⚠️ 恢复本地数据失败: {}", restore_err);
                    }
                }
                self.events
                    .emit(SyncEvent::WorkingOffline {
                        reason: e.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                Ok(LoadResult {
                    projects: self.projects(),
                    offline: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 重连合并：重新加载远端列表并与本地对账
    pub async fn reconnect_merge(&self, user_id: &str) -> Result<Vec<Project>> {
        let remote_projects = self.remote.load_projects(user_id).await?;
        info!("🔄 重连合并: remote={}", remote_projects.len());
        Ok(self.reconcile_with_remote(remote_projects).await)
    }

    /// 与远端项目列表对账，对同一输入重复执行结果不变
    async fn reconcile_with_remote(&self, remote_projects: Vec<Project>) -> Vec<Project> {
        let mut remote_by_id: HashMap<String, Project> =
            remote_projects.into_iter().map(|p| (p.id.clone(), p)).collect();
        let mut project_ids: Vec<String> = self.projects.read(|m| m.keys().cloned().collect());
        project_ids.extend(remote_by_id.keys().cloned());
        project_ids.extend(self.queue.projects_with_pending());
        project_ids.sort();
        project_ids.dedup();

        for project_id in project_ids {
            let remote = remote_by_id.remove(&project_id);
            let lock = self.project_lock(&project_id);
            let _guard = lock.lock().await;

            let pending = self.pending_mutations(&project_id);
            let baseline = self.baseline(&project_id);
            if let Some(remote) = &remote {
                let conflicted = self.conflicts.has_pending(&project_id)
                    || (!pending.is_empty()
                        && matches!(
                            self.detector.detect(baseline, remote, pending.len()),
                            Detection::Conflict { .. }
                        ));
                if conflicted {
                    self.raise_conflict(remote.clone(), baseline, pending.len()).await;
                    continue;
                }
            }

            let local = self.project(&project_id);
            match reconcile_project(local.as_ref(), remote.as_ref(), Some(pending.as_slice())) {
                Some(reconciled) => {
                    if let Some(remote) = &remote {
                        self.note_remote_advance(&project_id, baseline, remote.version);
                        self.set_baseline(&project_id, SyncBaseline::of(remote)).await;
                        if !pending.is_empty() {
                            self.queue.requeue_project(&project_id).await;
                        }
                    }
                    self.set_project(reconciled);
                }
                None => {
                    debug!("项目 {} 已在远端删除，移除本地副本", project_id);
                    self.projects.update(|m| m.remove(&project_id));
                    self.baselines.lock().remove(&project_id);
                    if let Some(storage) = &self.storage {
                        if let Err(e) = storage.delete_baseline(&project_id).await {
                            storage.note_write_failure("删除同步基线", &e);
                        }
                    }
                }
            }
        }
        self.projects()
    }

    // ========== 本地持久化 ==========

    /// 写入全部项目的检查点
    pub async fn checkpoint_now(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let projects: Vec<Project> = self.projects.read(|m| m.values().cloned().collect());
        let saved = storage.save_checkpoints(&projects).await?;
        storage.set_marker(keys::LAST_CHECKPOINT, now_millis()).await?;
        debug!("💾 检查点已写入: {} 个项目", saved);
        self.events
            .emit(SyncEvent::CheckpointSaved {
                projects: saved,
                timestamp: now_millis(),
            })
            .await;
        Ok(saved)
    }

    /// 从本地恢复：基线、队列、快照、未解决冲突，再恢复检查点
    pub async fn restore_local(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let baselines = storage.load_baselines().await?;
        *self.baselines.lock() = baselines;
        self.queue.restore().await?;
        self.snapshots.restore().await?;
        self.conflicts.restore().await?;
        self.restore_checkpoints().await
    }

    /// 读取检查点并在其上重放待同步变更，已在内存中的项目保持不变
    async fn restore_checkpoints(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let mut projects: HashMap<String, Project> = storage
            .load_checkpoints()
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        for project_id in self.queue.projects_with_pending() {
            let base = projects
                .remove(&project_id)
                .unwrap_or_else(|| Project::new(&project_id, &project_id, 0));
            let replayed = rebase(&base, self.pending_mutations(&project_id).iter());
            projects.insert(project_id, replayed);
        }

        let restored = self.projects.update(|current| {
            let mut restored = 0;
            for (project_id, project) in projects {
                if !current.contains_key(&project_id) {
                    current.insert(project_id, project);
                    restored += 1;
                }
            }
            restored
        });
        info!("🔄 本地数据已恢复: {} 个项目", restored);
        Ok(restored)
    }

    /// 清理过期快照，返回淘汰数量
    pub async fn sweep_snapshots(&self) -> usize {
        let report = self.snapshots.sweep(now_millis()).await;
        for (record, reason) in &report.evicted {
            self.events
                .emit(SyncEvent::SnapshotEvicted {
                    project_id: record.project_id.clone(),
                    snapshot_id: record.id.clone(),
                    reason: reason.as_str().to_string(),
                    timestamp: now_millis(),
                })
                .await;
        }
        report.count()
    }

    /// 导出全部本地数据（JSON）
    pub fn export_data(&self) -> Result<String> {
        let mut projects: Vec<Project> = self.projects.read(|m| m.values().cloned().collect());
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        let mut pending_actions = Vec::new();
        for project_id in self.queue.projects_with_pending() {
            pending_actions.extend(self.queue.pending_actions(&project_id));
        }
        let document = ExportDocument {
            exported_at: crate::utils::time::format_rfc3339(now_millis()),
            sdk: version_info(),
            projects,
            pending_actions,
            dead_letters: self.queue.dead_letters(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

#[async_trait]
impl DrainTarget for SyncCoordinator {
    async fn drain_ready(&self) -> Result<usize> {
        Ok(self.drain_once().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig, SnapshotConfig, TimeoutConfig};
    use crate::network::CircuitBreaker;
    use crate::storage::entities::Task;
    use crate::storage::queue::{RetryPolicy, TextField};
    use crate::sync::memory::MemoryTransport;
    use std::time::Duration;

    struct Harness {
        coordinator: Arc<SyncCoordinator>,
        transport: Arc<MemoryTransport>,
        events: Arc<EventManager>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(MemoryTransport::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            jitter_factor: 0.0,
            ..BreakerConfig::default()
        }));
        let retry = RetryConfig {
            initial_delay_ms: 0,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        let events = Arc::new(EventManager::new(64));
        let parts = CoordinatorParts {
            queue: Arc::new(ActionQueue::new(RetryPolicy::from(&retry), None)),
            snapshots: Arc::new(SnapshotTracker::new(SnapshotConfig::default(), None)),
            remote: Arc::new(GuardedRemote::new(transport.clone(), breaker, TimeoutConfig::default())),
            events: events.clone(),
            network: Arc::new(NetworkMonitor::new()),
            storage: None,
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
            events,
        }
    }

    fn edit_title(task_id: &str, text: &str) -> Mutation {
        Mutation::EditTaskText {
            task_id: task_id.into(),
            field: TextField::Title,
            text: text.into(),
            updated_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_mutation_snapshot_and_ack() {
        let h = harness();
        let c = &h.coordinator;
        c.apply_mutation("p1", Mutation::UpsertTask(Task::new("t1", "Draft", 0, 1)), false)
            .await
            .unwrap();
        assert_eq!(c.project("p1").unwrap().tasks.len(), 1);
        assert_eq!(c.snapshots().len(), 1);

        assert_eq!(c.drain_once().await, 1);
        assert!(c.snapshots().is_empty());
        assert_eq!(c.baseline("p1").unwrap().version, 1);
        assert_eq!(c.project("p1").unwrap().version, 1);
        assert_eq!(h.transport.project("p1").unwrap().tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_mutation_leaves_state_untouched() {
        let h = harness();
        let c = &h.coordinator;
        let err = c.apply_mutation("p1", edit_title("missing", "x"), true).await.unwrap_err();
        assert!(matches!(err, FlowSyncError::NotFound(_)));
        assert!(c.project("p1").is_none());
        assert!(c.snapshots().is_empty());
        assert_eq!(c.queue().total_pending(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_rolls_back_and_keeps_later_work() {
        let h = harness();
        let c = &h.coordinator;
        c.apply_mutation("p1", Mutation::UpsertTask(Task::new("t1", "Draft", 0, 1)), false)
            .await
            .unwrap();
        c.drain_once().await;

        c.apply_mutation("p1", Mutation::RenameProject { name: "Rejected".into(), updated_at: now_millis() }, false)
            .await
            .unwrap();
        c.apply_mutation("p1", Mutation::UpsertTask(Task::new("t2", "Later", 1, 2)), false)
            .await
            .unwrap();

        h.transport.fail_next(FlowSyncError::remote(422, "name rejected"));
        c.drain_once().await;

        let project = c.project("p1").unwrap();
        assert_eq!(project.name, "p1");
        assert!(project.task("t2").is_some());
        assert_eq!(c.dead_letters().len(), 1);
        assert_eq!(h.transport.project("p1").unwrap().tasks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_save_coalesces() {
        let h = harness();
        let c = &h.coordinator;
        for name in ["a", "ab", "abc"] {
            c.save_project(Project::new("p1", name, now_millis()));
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(c.project("p1").is_none());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(c.project("p1").unwrap().name, "abc");
        assert_eq!(c.queue().pending_count("p1"), 1);
    }

    #[tokio::test]
    async fn test_push_buffered_while_editing() {
        let h = harness();
        let c = &h.coordinator;
        let mut remote = Project::new("p1", "From other device", 1);
        remote.version = 3;

        c.begin_editing("p1");
        assert_eq!(c.handle_remote_push(remote.clone()).await.unwrap(), PushOutcome::Buffered);
        assert!(c.project("p1").is_none());

        assert_eq!(c.end_editing("p1").await.unwrap(), Some(PushOutcome::Applied));
        assert_eq!(c.project("p1").unwrap().name, "From other device");
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_push_replayed_after_lock_timeout() {
        let h = harness();
        let c = &h.coordinator;
        let replay = c.start_push_replay().unwrap();
        assert!(c.start_push_replay().is_none());

        let mut remote = Project::new("p1", "From other device", 1);
        remote.version = 4;
        c.begin_editing("p1");
        assert_eq!(c.handle_remote_push(remote).await.unwrap(), PushOutcome::Buffered);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(c.is_editing("p1"));
        assert!(c.project("p1").is_none());

        // 超过 editing_lock_timeout 后无需 end_editing
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let applied = tokio::time::timeout(Duration::from_secs(1), async {
            while c.project("p1").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(applied.is_ok(), "buffered push was not replayed");
        assert!(!c.is_editing("p1"));
        let project = c.project("p1").unwrap();
        assert_eq!(project.name, "From other device");
        assert_eq!(project.version, 4);
        assert_eq!(c.end_editing("p1").await.unwrap(), None);

        replay.abort();
    }

    #[tokio::test]
    async fn test_remote_resolution_discards_pending() {
        let h = harness();
        let c = &h.coordinator;
        let mut rx = h.events.subscribe();
        c.apply_mutation("p1", Mutation::UpsertTask(Task::new("t1", "Draft", 0, 1)), false)
            .await
            .unwrap();
        c.drain_once().await;
        c.apply_mutation("p1", edit_title("t1", "Local"), true).await.unwrap();

        let mut remote = h.transport.project("p1").unwrap();
        remote.version = 6;
        remote.name = "Remote wins".into();
        assert_eq!(c.handle_remote_push(remote).await.unwrap(), PushOutcome::ConflictRaised);
        assert_eq!(c.drain_once().await, 0);

        let resolved = c.resolve_conflict("p1", ConflictStrategy::Remote).await.unwrap();
        assert_eq!(resolved.name, "Remote wins");
        assert_eq!(c.queue().pending_count("p1"), 0);
        assert!(!c.can_undo("p1"));

        let mut saw_raised = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type() == "conflict_raised" {
                saw_raised = true;
            }
        }
        assert!(saw_raised);
    }

    #[tokio::test]
    async fn test_export_data() {
        let h = harness();
        let c = &h.coordinator;
        c.apply_mutation("p1", Mutation::RenameProject { name: "Roadmap".into(), updated_at: 1 }, false)
            .await
            .unwrap();
        let json = c.export_data().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["projects"][0]["name"], "Roadmap");
        assert_eq!(value["pending_actions"].as_array().unwrap().len(), 1);
    }
}
