//! 同步实体定义
//!
//! 项目（Project）包含任务（Task）与任务之间的连线（TaskConnection）。
//! 删除一律使用墓碑标记（deleted + updated_at），保证合并时删除可以传播。
//! 实体不包含 serde_json::Value 等自描述字段，检查点可以直接用 bincode 编码。

use serde::{Deserialize, Serialize};

/// 任务
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub content: String,
    /// 任务状态（todo / doing / done 等，由上层定义）
    pub status: String,
    /// 同级排序
    pub order: i64,
    pub parent_id: Option<String>,
    pub updated_at: i64,
    /// 墓碑标记
    pub deleted: bool,
}

/// 任务之间的连线
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskConnection {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub label: Option<String>,
    pub updated_at: i64,
    pub deleted: bool,
}

/// 项目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub connections: Vec<TaskConnection>,
    /// 远端分配的版本号，只增不减
    pub version: i64,
    pub updated_at: i64,
    pub deleted: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, order: i64, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            status: "todo".to_string(),
            order,
            parent_id: None,
            updated_at,
            deleted: false,
        }
    }
}

impl TaskConnection {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        updated_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            label: None,
            updated_at,
            deleted: false,
        }
    }
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            connections: Vec::new(),
            version: 0,
            updated_at,
            deleted: false,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// 未删除的任务，按 (order, id) 排序
    pub fn live_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().filter(|t| !t.deleted).collect();
        tasks.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// 版本只前进，不回退
    pub fn advance_version(&mut self, version: i64) {
        self.version = self.version.max(version);
    }

    pub fn touch(&mut self, timestamp: i64) {
        self.updated_at = self.updated_at.max(timestamp);
    }
}

/// 最近一次确认的远端状态（冲突检测与撤销保护的基线）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncBaseline {
    pub version: i64,
    pub updated_at: i64,
}

impl SyncBaseline {
    pub fn of(project: &Project) -> Self {
        Self {
            version: project.version,
            updated_at: project.updated_at,
        }
    }
}

/// 乐观快照：变更应用前的项目状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub project_id: String,
    pub prior_state: Project,
    pub created_at: i64,
}

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// 保留本地，待同步动作基于新基线重新排队
    Local,
    /// 采用远端，丢弃本地待同步动作
    Remote,
    /// 逐实体合并，合并结果作为新动作排队
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Merge => "merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ConflictStrategy::Local),
            "remote" => Some(ConflictStrategy::Remote),
            "merge" => Some(ConflictStrategy::Merge),
            _ => None,
        }
    }
}

/// 冲突解决记录（审计用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub project_id: String,
    pub local_version: i64,
    pub remote_version: i64,
    pub resolution: ConflictStrategy,
    pub timestamp: i64,
    pub archived: bool,
}

/// 等待用户选择策略的冲突，解决前持久化，重启后仍阻止该项目的推送
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub id: String,
    pub project_id: String,
    pub local: Project,
    pub remote: Project,
    pub local_version: i64,
    pub remote_version: i64,
    pub pending_actions: usize,
    pub raised_at: i64,
}

/// 项目检查点（本地离线回退数据）
#[derive(Debug, Clone)]
pub struct ProjectCheckpoint {
    pub project: Project,
    /// payload 的 sha256
    pub digest: String,
    pub saved_at: i64,
}
