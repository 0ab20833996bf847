//! 持久化动作队列
//!
//! - 每个项目一个 FIFO，项目之间互不阻塞
//! - 每个项目同一时刻最多一个动作在执行
//! - 只有显式标记为可合并的动作才会与队尾合并，合并不会越过其他动作
//! - 失败后按重试策略退避，重试耗尽或不可重试的失败进入死信
//! - 所有变更写入 SQLite，重启后恢复（执行中的动作重置为待执行）

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FlowSyncError, Result};
use crate::storage::StorageManager;
use crate::utils::time::now_millis;

pub mod action;
pub mod consumer;
pub mod retry_policy;

pub use action::{ActionKind, Mutation, QueuedAction, TextField};
pub use consumer::{ActionConsumerRunner, ConsumerConfig, DrainMetrics, DrainTarget};
pub use retry_policy::{FailureReason, RetryDecision, RetryPolicy};

/// 队列统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub projects: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub waiting_retry: usize,
    pub dead_letters: usize,
    pub enqueued_total: u64,
    pub coalesced_total: u64,
    pub succeeded_total: u64,
    pub retried_total: u64,
    pub dead_lettered_total: u64,
}

/// 入队结果
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    /// 最终承载该变更的动作 ID（合并时为队尾动作的 ID）
    pub action_id: String,
    pub coalesced: bool,
    /// 相同 ID 的动作已存在并被替换
    pub replaced: bool,
    /// 合并/替换后不再需要的快照，由调用方丢弃
    pub superseded_snapshot: Option<String>,
}

/// 失败处理结果
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    RetryScheduled { action: QueuedAction, delay: Duration },
    DeadLettered { action: QueuedAction, reason: String },
}

#[derive(Debug, Default)]
struct QueueInner {
    projects: HashMap<String, VecDeque<QueuedAction>>,
    dead_letters: Vec<QueuedAction>,
    enqueued_total: u64,
    coalesced_total: u64,
    succeeded_total: u64,
    retried_total: u64,
    dead_lettered_total: u64,
}

impl QueueInner {
    /// 定位动作所在项目队列及下标
    fn locate(&self, action_id: &str) -> Option<(String, usize)> {
        self.projects.iter().find_map(|(pid, queue)| {
            queue
                .iter()
                .position(|a| a.id == action_id)
                .map(|idx| (pid.clone(), idx))
        })
    }

    fn in_flight_head_mut(&mut self, action_id: &str) -> Result<&mut QueuedAction> {
        let (pid, idx) = self
            .locate(action_id)
            .ok_or_else(|| FlowSyncError::NotFound(format!("动作 {}", action_id)))?;
        let queue = self
            .projects
            .get_mut(&pid)
            .ok_or_else(|| FlowSyncError::NotFound(format!("项目队列 {}", pid)))?;
        match queue.get_mut(idx) {
            Some(action) if idx == 0 && action.in_flight => Ok(action),
            _ => Err(FlowSyncError::InvalidOperation(format!(
                "动作 {} 不在执行中",
                action_id
            ))),
        }
    }

    fn remove_head(&mut self, project_id: &str) -> Option<QueuedAction> {
        let queue = self.projects.get_mut(project_id)?;
        let action = queue.pop_front();
        if queue.is_empty() {
            self.projects.remove(project_id);
        }
        action
    }
}

/// 动作队列
pub struct ActionQueue {
    inner: Mutex<QueueInner>,
    policy: RetryPolicy,
    storage: Option<Arc<StorageManager>>,
    wake: Arc<Notify>,
    consumer_attached: AtomicBool,
    stalled: AtomicBool,
    created_at: Instant,
}

impl ActionQueue {
    pub fn new(policy: RetryPolicy, storage: Option<Arc<StorageManager>>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            policy,
            storage,
            wake: Arc::new(Notify::new()),
            consumer_attached: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 有新动作可执行时被唤醒
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    async fn persist(&self, action: &QueuedAction) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_action(action).await {
                storage.note_write_failure("保存动作", &e);
            }
        }
    }

    async fn forget(&self, action_id: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete_action(action_id).await {
                storage.note_write_failure("删除动作", &e);
            }
        }
    }

    /// 从持久化存储恢复队列，执行中的动作重置为待执行
    pub async fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let actions = storage.load_actions().await?;
        let count = actions.len();
        let mut inner = self.inner.lock();
        inner.projects.clear();
        inner.dead_letters.clear();
        for mut action in actions {
            action.in_flight = false;
            if action.dead_letter {
                inner.dead_letters.push(action);
            } else {
                inner
                    .projects
                    .entry(action.project_id.clone())
                    .or_default()
                    .push_back(action);
            }
        }
        drop(inner);
        if count > 0 {
            info!("🔄 已从本地恢复 {} 个待同步动作", count);
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// 入队
    ///
    /// - 相同 ID 的动作已在队列中：替换其内容（执行中的重复动作被忽略）
    /// - 可合并且与队尾合并键相同：合并到队尾
    /// - 否则追加到项目 FIFO 末尾
    pub async fn enqueue(&self, action: QueuedAction) -> Result<EnqueueOutcome> {
        if action.project_id.trim().is_empty() {
            return Err(FlowSyncError::Validation("project_id 不能为空".to_string()));
        }
        action.payload.validate(&action.project_id)?;

        let (outcome, to_persist) = {
            let mut inner = self.inner.lock();
            inner.enqueued_total += 1;
            let queue = inner.projects.entry(action.project_id.clone()).or_default();

            if let Some(existing) = queue.iter_mut().find(|a| a.id == action.id) {
                if existing.in_flight {
                    debug!("动作 {} 正在执行，忽略重复入队", action.id);
                    return Ok(EnqueueOutcome {
                        action_id: action.id,
                        coalesced: false,
                        replaced: false,
                        superseded_snapshot: action.snapshot_id,
                    });
                }
                let superseded = match action.snapshot_id {
                    Some(new) if existing.snapshot_id.is_none() => {
                        existing.snapshot_id = Some(new);
                        None
                    }
                    Some(new) if existing.snapshot_id.as_deref() != Some(new.as_str()) => Some(new),
                    _ => None,
                };
                existing.kind = action.kind;
                existing.payload = action.payload;
                (
                    EnqueueOutcome {
                        action_id: existing.id.clone(),
                        coalesced: false,
                        replaced: true,
                        superseded_snapshot: superseded,
                    },
                    existing.clone(),
                )
            } else {
                let merge_target = match (queue.back_mut(), action.coalesce_key()) {
                    (Some(tail), Some(key))
                        if !tail.in_flight && tail.coalesce_key().as_deref() == Some(key.as_str()) =>
                    {
                        Some(tail)
                    }
                    _ => None,
                };
                match merge_target {
                    Some(tail) => {
                        tail.kind = action.kind;
                        tail.payload = action.payload;
                        let outcome = EnqueueOutcome {
                            action_id: tail.id.clone(),
                            coalesced: true,
                            replaced: false,
                            superseded_snapshot: action.snapshot_id,
                        };
                        let merged = tail.clone();
                        inner.coalesced_total += 1;
                        (outcome, merged)
                    }
                    None => {
                        queue.push_back(action.clone());
                        (
                            EnqueueOutcome {
                                action_id: action.id.clone(),
                                coalesced: false,
                                replaced: false,
                                superseded_snapshot: None,
                            },
                            action,
                        )
                    }
                }
            }
        };

        self.persist(&to_persist).await;
        debug!(
            "📥 动作入队: project={}, action={}, kind={}, coalesced={}",
            to_persist.project_id, outcome.action_id, to_persist.kind, outcome.coalesced
        );
        self.wake.notify_one();
        Ok(outcome)
    }

    /// 取出项目队首可执行的动作并标记为执行中
    ///
    /// 队首正在执行或未到重试时间时返回 None，保证项目内严格串行。
    pub fn next_ready(&self, project_id: &str, now: i64) -> Option<QueuedAction> {
        let mut inner = self.inner.lock();
        let head = inner.projects.get_mut(project_id)?.front_mut()?;
        if !head.is_ready(now) {
            return None;
        }
        head.in_flight = true;
        head.attempt += 1;
        Some(head.clone())
    }

    /// 队首可执行的项目列表
    pub fn ready_projects(&self, now: i64) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .projects
            .iter()
            .filter(|(_, q)| q.front().map(|a| a.is_ready(now)).unwrap_or(false))
            .map(|(pid, _)| pid.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 最早的重试到期时间
    pub fn next_retry_at(&self) -> Option<i64> {
        let inner = self.inner.lock();
        inner
            .projects
            .values()
            .filter_map(|q| q.front())
            .filter(|a| !a.in_flight)
            .filter_map(|a| a.next_retry_at)
            .min()
    }

    /// 远端确认成功，移出队列
    pub async fn ack_success(&self, action_id: &str) -> Result<QueuedAction> {
        let removed = {
            let mut inner = self.inner.lock();
            let project_id = inner.in_flight_head_mut(action_id)?.project_id.clone();
            let removed = inner.remove_head(&project_id);
            if removed.is_some() {
                inner.succeeded_total += 1;
            }
            removed
        }
        .ok_or_else(|| FlowSyncError::NotFound(format!("动作 {}", action_id)))?;

        self.forget(action_id).await;
        debug!("✅ 动作完成: {} (attempt {})", action_id, removed.attempt);
        self.wake.notify_one();
        Ok(removed)
    }

    /// 执行失败：按重试策略安排重试或进入死信
    pub async fn ack_failure(&self, action_id: &str, error: &FlowSyncError) -> Result<FailureOutcome> {
        let reason = FailureReason::from(error);
        let outcome = {
            let mut inner = self.inner.lock();
            let head = inner.in_flight_head_mut(action_id)?;
            head.in_flight = false;
            head.last_error = Some(error.to_string());
            match self.policy.decide(head.attempt, &reason) {
                RetryDecision::Retry { delay } => {
                    head.next_retry_at = Some(now_millis() + delay.as_millis() as i64);
                    let action = head.clone();
                    inner.retried_total += 1;
                    FailureOutcome::RetryScheduled { action, delay }
                }
                RetryDecision::DeadLetter { reason } => {
                    let project_id = head.project_id.clone();
                    let mut action = inner
                        .remove_head(&project_id)
                        .ok_or_else(|| FlowSyncError::NotFound(format!("动作 {}", action_id)))?;
                    action.dead_letter = true;
                    action.next_retry_at = None;
                    inner.dead_letters.push(action.clone());
                    inner.dead_lettered_total += 1;
                    FailureOutcome::DeadLettered { action, reason }
                }
            }
        };

        match &outcome {
            FailureOutcome::RetryScheduled { action, delay } => {
                warn!(
                    "⚠️ 动作失败，{}ms 后重试: action={}, attempt={}, error={}",
                    delay.as_millis(),
                    action.id,
                    action.attempt,
                    error
                );
                self.persist(action).await;
            }
            FailureOutcome::DeadLettered { action, reason } => {
                warn!("⚠️ 动作进入死信: action={}, {}", action.id, reason);
                self.persist(action).await;
                self.wake.notify_one();
            }
        }
        Ok(outcome)
    }

    /// 归还未实际发出的动作（例如熔断器拒绝），不计入尝试次数
    pub fn release(&self, action_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let head = inner.in_flight_head_mut(action_id)?;
        head.in_flight = false;
        head.attempt = head.attempt.saturating_sub(1);
        Ok(())
    }

    pub fn pending_actions(&self, project_id: &str) -> Vec<QueuedAction> {
        self.inner
            .lock()
            .projects
            .get(project_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, project_id: &str) -> usize {
        self.inner
            .lock()
            .projects
            .get(project_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.inner.lock().projects.values().map(|q| q.len()).sum()
    }

    pub fn projects_with_pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().projects.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_in_flight(&self, project_id: &str) -> bool {
        self.inner
            .lock()
            .projects
            .get(project_id)
            .and_then(|q| q.front())
            .map(|a| a.in_flight)
            .unwrap_or(false)
    }

    /// 移除项目的全部待同步动作（采用远端版本时）
    pub async fn clear_project(&self, project_id: &str) -> Vec<QueuedAction> {
        let removed: Vec<QueuedAction> = self
            .inner
            .lock()
            .projects
            .remove(project_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();
        if !removed.is_empty() {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.delete_project_actions(project_id).await {
                    storage.note_write_failure("清空项目动作", &e);
                }
            }
            info!("🗑️ 已丢弃项目 {} 的 {} 个待同步动作", project_id, removed.len());
        }
        removed
    }

    /// 基于新基线重新排队：清空重试计数与等待时间
    pub async fn requeue_project(&self, project_id: &str) -> usize {
        let updated: Vec<QueuedAction> = {
            let mut inner = self.inner.lock();
            match inner.projects.get_mut(project_id) {
                Some(queue) => queue
                    .iter_mut()
                    .filter(|a| !a.in_flight)
                    .map(|a| {
                        a.attempt = 0;
                        a.next_retry_at = None;
                        a.last_error = None;
                        a.clone()
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        for action in &updated {
            self.persist(action).await;
        }
        if !updated.is_empty() {
            self.wake.notify_one();
        }
        updated.len()
    }

    pub fn dead_letters(&self) -> Vec<QueuedAction> {
        self.inner.lock().dead_letters.clone()
    }

    /// 将死信动作重新放回项目队尾
    pub async fn retry_dead_letter(&self, action_id: &str) -> Result<QueuedAction> {
        let action = {
            let mut inner = self.inner.lock();
            let idx = inner
                .dead_letters
                .iter()
                .position(|a| a.id == action_id)
                .ok_or_else(|| FlowSyncError::NotFound(format!("死信动作 {}", action_id)))?;
            let mut action = inner.dead_letters.remove(idx);
            action.dead_letter = false;
            action.attempt = 0;
            action.next_retry_at = None;
            action.in_flight = false;
            inner
                .projects
                .entry(action.project_id.clone())
                .or_default()
                .push_back(action.clone());
            action
        };
        self.persist(&action).await;
        info!("🔄 死信动作重新入队: {}", action_id);
        self.wake.notify_one();
        Ok(action)
    }

    /// 永久丢弃死信动作
    pub async fn discard_dead_letter(&self, action_id: &str) -> Result<QueuedAction> {
        let action = {
            let mut inner = self.inner.lock();
            let idx = inner
                .dead_letters
                .iter()
                .position(|a| a.id == action_id)
                .ok_or_else(|| FlowSyncError::NotFound(format!("死信动作 {}", action_id)))?;
            inner.dead_letters.remove(idx)
        };
        self.forget(action_id).await;
        Ok(action)
    }

    pub fn attach_consumer(&self) {
        self.consumer_attached.store(true, Ordering::SeqCst);
        self.stalled.store(false, Ordering::SeqCst);
    }

    pub fn detach_consumer(&self) {
        self.consumer_attached.store(false, Ordering::SeqCst);
    }

    pub fn is_consumer_attached(&self) -> bool {
        self.consumer_attached.load(Ordering::SeqCst)
    }

    /// 停滞检测：创建超过 `timeout` 仍无消费者且有待同步动作时返回待同步数量
    ///
    /// 每次停滞只报告一次，消费者挂载后重置。
    pub fn check_stalled(&self, timeout: Duration) -> Option<usize> {
        if self.is_consumer_attached() || self.created_at.elapsed() < timeout {
            return None;
        }
        let pending = self.total_pending();
        if pending == 0 || self.stalled.swap(true, Ordering::SeqCst) {
            return None;
        }
        warn!("⚠️ 动作队列停滞: {} 个动作等待中但没有消费者", pending);
        Some(pending)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let now = now_millis();
        let inner = self.inner.lock();
        let all = inner.projects.values().flat_map(|q| q.iter());
        let (mut in_flight, mut waiting_retry) = (0, 0);
        for action in all {
            if action.in_flight {
                in_flight += 1;
            } else if action.next_retry_at.map(|t| t > now).unwrap_or(false) {
                waiting_retry += 1;
            }
        }
        QueueStats {
            projects: inner.projects.len(),
            pending: inner.projects.values().map(|q| q.len()).sum(),
            in_flight,
            waiting_retry,
            dead_letters: inner.dead_letters.len(),
            enqueued_total: inner.enqueued_total,
            coalesced_total: inner.coalesced_total,
            succeeded_total: inner.succeeded_total,
            retried_total: inner.retried_total,
            dead_lettered_total: inner.dead_lettered_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            initial_delay_ms: 0,
            ..RetryPolicy::default()
        }
    }

    fn rename(project_id: &str, name: &str) -> QueuedAction {
        QueuedAction::new(project_id, Mutation::RenameProject { name: name.into(), updated_at: 1 })
    }

    fn edit(project_id: &str, task_id: &str, text: &str) -> QueuedAction {
        QueuedAction::new(
            project_id,
            Mutation::EditTaskText {
                task_id: task_id.into(),
                field: TextField::Title,
                text: text.into(),
                updated_at: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_fifo_and_single_in_flight() {
        let queue = ActionQueue::new(policy(), None);
        let a = queue.enqueue(rename("p1", "a")).await.unwrap().action_id;
        let b = queue.enqueue(QueuedAction::new("p1", Mutation::DeleteProject { deleted_at: 2 })).await.unwrap().action_id;
        let c = queue.enqueue(rename("p2", "c")).await.unwrap().action_id;

        let now = now_millis();
        let first = queue.next_ready("p1", now).unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.attempt, 1);
        assert!(queue.next_ready("p1", now).is_none(), "only one in flight per project");

        // 其他项目不受影响
        assert_eq!(queue.next_ready("p2", now).unwrap().id, c);

        queue.ack_success(&a).await.unwrap();
        assert_eq!(queue.next_ready("p1", now_millis()).unwrap().id, b);
        assert!(queue.ack_success(&a).await.is_err(), "ack is exactly once");
    }

    #[tokio::test]
    async fn test_coalesce_only_marked_tail() {
        let queue = ActionQueue::new(policy(), None);
        let first = queue.enqueue(edit("p1", "t1", "H").coalescible()).await.unwrap();
        let second = queue.enqueue(edit("p1", "t1", "He").coalescible()).await.unwrap();
        assert!(second.coalesced);
        assert_eq!(second.action_id, first.action_id);
        assert_eq!(queue.pending_count("p1"), 1);

        // 未标记可合并的编辑不合并
        let third = queue.enqueue(edit("p1", "t1", "Hel")).await.unwrap();
        assert!(!third.coalesced);

        // 中间隔着其他动作时不合并
        queue.enqueue(rename("p1", "x")).await.unwrap();
        let fifth = queue.enqueue(edit("p1", "t1", "Hell").coalescible()).await.unwrap();
        assert!(!fifth.coalesced);
        assert_eq!(queue.pending_count("p1"), 4);

        let pending = queue.pending_actions("p1");
        assert!(matches!(&pending[0].payload, Mutation::EditTaskText { text, .. } if text == "He"));
    }

    #[tokio::test]
    async fn test_coalesce_skips_in_flight_tail() {
        let queue = ActionQueue::new(policy(), None);
        queue.enqueue(edit("p1", "t1", "a").coalescible()).await.unwrap();
        queue.next_ready("p1", now_millis()).unwrap();
        let outcome = queue.enqueue(edit("p1", "t1", "ab").coalescible()).await.unwrap();
        assert!(!outcome.coalesced);
        assert_eq!(queue.pending_count("p1"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_replaces() {
        let queue = ActionQueue::new(policy(), None);
        let action = rename("p1", "v1").with_id("fixed");
        queue.enqueue(action.clone()).await.unwrap();
        let replay = QueuedAction::new("p1", Mutation::RenameProject { name: "v2".into(), updated_at: 2 })
            .with_id("fixed");
        let outcome = queue.enqueue(replay).await.unwrap();
        assert!(outcome.replaced);
        assert_eq!(queue.pending_count("p1"), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success_counts_attempts() {
        let queue = ActionQueue::new(policy(), None);
        let id = queue.enqueue(rename("p1", "a")).await.unwrap().action_id;

        for _ in 0..2 {
            let action = queue.next_ready("p1", now_millis()).unwrap();
            let outcome = queue
                .ack_failure(&action.id, &FlowSyncError::Timeout("apply".into()))
                .await
                .unwrap();
            assert!(matches!(outcome, FailureOutcome::RetryScheduled { .. }));
        }
        let action = queue.next_ready("p1", now_millis()).unwrap();
        assert_eq!(action.attempt, 3);
        let done = queue.ack_success(&id).await.unwrap();
        assert_eq!(done.attempt, 3);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.stats().retried_total, 2);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let queue = ActionQueue::new(
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            None,
        );
        queue.enqueue(rename("p1", "a")).await.unwrap();
        let action = queue.next_ready("p1", now_millis()).unwrap();
        queue.ack_failure(&action.id, &FlowSyncError::remote(503, "x")).await.unwrap();

        assert!(queue.next_ready("p1", now_millis()).is_none());
        assert!(queue.ready_projects(now_millis()).is_empty());
        assert!(queue.next_ready("p1", now_millis() + 1_500).is_some());
    }

    #[tokio::test]
    async fn test_validation_failure_dead_letters_immediately() {
        let queue = ActionQueue::new(policy(), None);
        let id = queue.enqueue(rename("p1", "a")).await.unwrap().action_id;
        let next = queue.enqueue(rename("p1", "b")).await.unwrap().action_id;

        let action = queue.next_ready("p1", now_millis()).unwrap();
        let outcome = queue.ack_failure(&action.id, &FlowSyncError::remote(422, "invalid")).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));
        assert_eq!(queue.dead_letters()[0].id, id);

        // 死信移出活跃队列，后续动作可以继续
        assert_eq!(queue.next_ready("p1", now_millis()).unwrap().id, next);
    }

    #[tokio::test]
    async fn test_dead_letter_retry_and_discard() {
        let queue = ActionQueue::new(policy(), None);
        let id = queue.enqueue(rename("p1", "a")).await.unwrap().action_id;
        let action = queue.next_ready("p1", now_millis()).unwrap();
        queue.ack_failure(&action.id, &FlowSyncError::Validation("x".into())).await.unwrap();

        queue.retry_dead_letter(&id).await.unwrap();
        assert!(queue.dead_letters().is_empty());
        let again = queue.next_ready("p1", now_millis()).unwrap();
        assert_eq!(again.attempt, 1);
        queue.ack_failure(&again.id, &FlowSyncError::Validation("x".into())).await.unwrap();

        queue.discard_dead_letter(&id).await.unwrap();
        assert!(queue.discard_dead_letter(&id).await.is_err());
        assert_eq!(queue.total_pending(), 0);
    }

    #[tokio::test]
    async fn test_release_does_not_count_attempt() {
        let queue = ActionQueue::new(policy(), None);
        queue.enqueue(rename("p1", "a")).await.unwrap();
        let action = queue.next_ready("p1", now_millis()).unwrap();
        queue.release(&action.id).unwrap();
        assert_eq!(queue.next_ready("p1", now_millis()).unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_restore_resets_in_flight() {
        let storage = Arc::new(StorageManager::in_memory());
        storage.init_user("u1").await.unwrap();

        let queue = ActionQueue::new(policy(), Some(storage.clone()));
        let a = queue.enqueue(rename("p1", "a")).await.unwrap().action_id;
        queue.enqueue(rename("p1", "b")).await.unwrap();
        let dead = queue.enqueue(rename("p2", "c")).await.unwrap().action_id;
        let in_flight = queue.next_ready("p2", now_millis()).unwrap();
        queue.ack_failure(&in_flight.id, &FlowSyncError::Validation("bad".into())).await.unwrap();
        queue.next_ready("p1", now_millis()).unwrap();

        let restored = ActionQueue::new(policy(), Some(storage));
        assert_eq!(restored.restore().await.unwrap(), 3);
        assert_eq!(restored.pending_count("p1"), 2);
        assert_eq!(restored.dead_letters()[0].id, dead);
        assert_eq!(restored.next_ready("p1", now_millis()).unwrap().id, a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_detection() {
        let queue = ActionQueue::new(policy(), None);
        queue.enqueue(rename("p1", "a")).await.unwrap();
        assert!(queue.check_stalled(Duration::from_secs(10)).is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.check_stalled(Duration::from_secs(10)), Some(1));
        assert!(queue.check_stalled(Duration::from_secs(10)).is_none(), "reported once");
        assert!(queue.is_stalled());

        queue.attach_consumer();
        assert!(!queue.is_stalled());
        assert!(queue.check_stalled(Duration::from_secs(10)).is_none());
    }
}
