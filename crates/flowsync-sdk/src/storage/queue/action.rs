use crate::error::{FlowSyncError, Result};
use crate::storage::entities::{Project, Task, TaskConnection};
use crate::utils::time::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 可编辑的任务文本字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextField {
    Title,
    Content,
}

impl TextField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextField::Title => "title",
            TextField::Content => "content",
        }
    }
}

/// 对项目的一次变更
///
/// 变更携带创建时确定的时间戳，`apply` 不读取当前时间，
/// 同一变更重复应用的结果与应用一次相同（重放幂等）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// 创建或整体更新任务
    UpsertTask(Task),
    /// 编辑任务文本（可合并的高频操作）
    EditTaskText {
        task_id: String,
        field: TextField,
        text: String,
        updated_at: i64,
    },
    MoveTask {
        task_id: String,
        parent_id: Option<String>,
        order: i64,
        updated_at: i64,
    },
    DeleteTask { task_id: String, deleted_at: i64 },
    UpsertConnection(TaskConnection),
    DeleteConnection { connection_id: String, deleted_at: i64 },
    RenameProject { name: String, updated_at: i64 },
    /// 整项目保存（去抖保存、合并结果、撤销恢复）
    SaveProject(Project),
    DeleteProject { deleted_at: i64 },
}

/// 动作类型，用于持久化与日志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    UpsertTask,
    EditTaskText,
    MoveTask,
    DeleteTask,
    UpsertConnection,
    DeleteConnection,
    RenameProject,
    SaveProject,
    DeleteProject,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::UpsertTask => "upsert_task",
            ActionKind::EditTaskText => "edit_task_text",
            ActionKind::MoveTask => "move_task",
            ActionKind::DeleteTask => "delete_task",
            ActionKind::UpsertConnection => "upsert_connection",
            ActionKind::DeleteConnection => "delete_connection",
            ActionKind::RenameProject => "rename_project",
            ActionKind::SaveProject => "save_project",
            ActionKind::DeleteProject => "delete_project",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Mutation {
    pub fn kind(&self) -> ActionKind {
        match self {
            Mutation::UpsertTask(_) => ActionKind::UpsertTask,
            Mutation::EditTaskText { .. } => ActionKind::EditTaskText,
            Mutation::MoveTask { .. } => ActionKind::MoveTask,
            Mutation::DeleteTask { .. } => ActionKind::DeleteTask,
            Mutation::UpsertConnection(_) => ActionKind::UpsertConnection,
            Mutation::DeleteConnection { .. } => ActionKind::DeleteConnection,
            Mutation::RenameProject { .. } => ActionKind::RenameProject,
            Mutation::SaveProject(_) => ActionKind::SaveProject,
            Mutation::DeleteProject { .. } => ActionKind::DeleteProject,
        }
    }

    /// 合并键：只有目标相同的高频编辑才可能合并
    pub fn coalesce_key(&self) -> Option<String> {
        match self {
            Mutation::EditTaskText { task_id, field, .. } => {
                Some(format!("task:{}:{}", task_id, field.as_str()))
            }
            Mutation::MoveTask { task_id, .. } => Some(format!("task:{}:position", task_id)),
            Mutation::RenameProject { .. } => Some("project:name".to_string()),
            Mutation::SaveProject(_) => Some("project:full".to_string()),
            _ => None,
        }
    }

    /// 本地校验，失败的变更直接拒绝，不进入队列
    pub fn validate(&self, project_id: &str) -> Result<()> {
        let empty = |what: &str| Err(FlowSyncError::Validation(format!("{} 不能为空", what)));
        match self {
            Mutation::UpsertTask(task) if task.id.trim().is_empty() => empty("task.id"),
            Mutation::EditTaskText { task_id, .. }
            | Mutation::MoveTask { task_id, .. }
            | Mutation::DeleteTask { task_id, .. }
                if task_id.trim().is_empty() =>
            {
                empty("task_id")
            }
            Mutation::MoveTask { task_id, parent_id: Some(parent), .. } if parent == task_id => Err(
                FlowSyncError::Validation(format!("任务 {} 不能成为自己的父任务", task_id)),
            ),
            Mutation::UpsertConnection(conn) if conn.id.trim().is_empty() => empty("connection.id"),
            Mutation::UpsertConnection(conn) if conn.source_id == conn.target_id => Err(
                FlowSyncError::Validation(format!("连线 {} 的两端不能是同一个任务", conn.id)),
            ),
            Mutation::DeleteConnection { connection_id, .. } if connection_id.trim().is_empty() => {
                empty("connection_id")
            }
            Mutation::RenameProject { name, .. } if name.trim().is_empty() => empty("项目名称"),
            Mutation::SaveProject(project) if project.id != project_id => {
                Err(FlowSyncError::Validation(format!(
                    "保存的项目 {} 与目标项目 {} 不一致",
                    project.id, project_id
                )))
            }
            _ => Ok(()),
        }
    }

    /// 变更携带的时间戳
    pub fn timestamp(&self) -> i64 {
        match self {
            Mutation::UpsertTask(task) => task.updated_at,
            Mutation::EditTaskText { updated_at, .. }
            | Mutation::MoveTask { updated_at, .. }
            | Mutation::RenameProject { updated_at, .. } => *updated_at,
            Mutation::DeleteTask { deleted_at, .. }
            | Mutation::DeleteConnection { deleted_at, .. }
            | Mutation::DeleteProject { deleted_at } => *deleted_at,
            Mutation::UpsertConnection(conn) => conn.updated_at,
            Mutation::SaveProject(project) => project.updated_at,
        }
    }

    /// 将变更应用到项目上（幂等）
    pub fn apply(&self, project: &mut Project) -> Result<()> {
        match self {
            Mutation::UpsertTask(task) => match project.task_mut(&task.id) {
                Some(existing) => *existing = task.clone(),
                None => project.tasks.push(task.clone()),
            },
            Mutation::EditTaskText { task_id, field, text, updated_at } => {
                let task = live_task_mut(project, task_id)?;
                match field {
                    TextField::Title => task.title = text.clone(),
                    TextField::Content => task.content = text.clone(),
                }
                task.updated_at = task.updated_at.max(*updated_at);
            }
            Mutation::MoveTask { task_id, parent_id, order, updated_at } => {
                if let Some(parent) = parent_id {
                    if project.task(parent).map(|t| t.deleted).unwrap_or(true) {
                        return Err(FlowSyncError::Validation(format!("父任务 {} 不存在", parent)));
                    }
                }
                let task = live_task_mut(project, task_id)?;
                task.parent_id = parent_id.clone();
                task.order = *order;
                task.updated_at = task.updated_at.max(*updated_at);
            }
            Mutation::DeleteTask { task_id, deleted_at } => {
                let task = project
                    .task_mut(task_id)
                    .ok_or_else(|| FlowSyncError::NotFound(format!("任务 {}", task_id)))?;
                task.deleted = true;
                task.updated_at = task.updated_at.max(*deleted_at);
                for conn in project
                    .connections
                    .iter_mut()
                    .filter(|c| &c.source_id == task_id || &c.target_id == task_id)
                {
                    conn.deleted = true;
                    conn.updated_at = conn.updated_at.max(*deleted_at);
                }
            }
            Mutation::UpsertConnection(conn) => {
                for endpoint in [&conn.source_id, &conn.target_id] {
                    if project.task(endpoint).map(|t| t.deleted).unwrap_or(true) {
                        return Err(FlowSyncError::Validation(format!(
                            "连线 {} 引用了不存在的任务 {}",
                            conn.id, endpoint
                        )));
                    }
                }
                match project.connections.iter_mut().find(|c| c.id == conn.id) {
                    Some(existing) => *existing = conn.clone(),
                    None => project.connections.push(conn.clone()),
                }
            }
            Mutation::DeleteConnection { connection_id, deleted_at } => {
                let conn = project
                    .connections
                    .iter_mut()
                    .find(|c| &c.id == connection_id)
                    .ok_or_else(|| FlowSyncError::NotFound(format!("连线 {}", connection_id)))?;
                conn.deleted = true;
                conn.updated_at = conn.updated_at.max(*deleted_at);
            }
            Mutation::RenameProject { name, .. } => {
                project.name = name.clone();
            }
            Mutation::SaveProject(saved) => {
                let version = project.version.max(saved.version);
                *project = saved.clone();
                project.version = version;
            }
            Mutation::DeleteProject { .. } => {
                project.deleted = true;
            }
        }
        project.touch(self.timestamp());
        Ok(())
    }
}

fn live_task_mut<'a>(project: &'a mut Project, task_id: &str) -> Result<&'a mut Task> {
    match project.task_mut(task_id) {
        Some(task) if !task.deleted => Ok(task),
        Some(_) => Err(FlowSyncError::Validation(format!("任务 {} 已删除", task_id))),
        None => Err(FlowSyncError::NotFound(format!("任务 {}", task_id))),
    }
}

/// 队列中的动作
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    /// 客户端生成的稳定 ID，远端据此去重
    pub id: String,
    pub kind: ActionKind,
    pub payload: Mutation,
    pub project_id: String,
    /// 已尝试次数
    pub attempt: u32,
    pub created_at: i64,
    pub dead_letter: bool,
    /// 正在执行中（每个项目同时最多一个）
    pub in_flight: bool,
    /// 下次可重试时间（毫秒时间戳）
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// 关联的乐观快照
    pub snapshot_id: Option<String>,
    /// 是否允许与队尾的同类动作合并
    pub coalescible: bool,
}

impl QueuedAction {
    pub fn new(project_id: impl Into<String>, payload: Mutation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: payload.kind(),
            payload,
            project_id: project_id.into(),
            attempt: 0,
            created_at: now_millis(),
            dead_letter: false,
            in_flight: false,
            next_retry_at: None,
            last_error: None,
            snapshot_id: None,
            coalescible: false,
        }
    }

    /// 指定 ID（重放或远端去重场景）
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    /// 标记为可合并，只对有合并键的变更生效
    pub fn coalescible(mut self) -> Self {
        self.coalescible = self.payload.coalesce_key().is_some();
        self
    }

    pub fn coalesce_key(&self) -> Option<String> {
        if self.coalescible {
            self.payload.coalesce_key()
        } else {
            None
        }
    }

    /// 是否到达可执行时间
    pub fn is_ready(&self, now: i64) -> bool {
        !self.in_flight && !self.dead_letter && self.next_retry_at.map(|t| now >= t).unwrap_or(true)
    }
}
