//! 撤销/重做版本保护
//!
//! 每条撤销记录保存变更前后的项目状态，以及记录时该项目被“外部”推进的累计版本数
//! （其他设备写入、冲突解决等，不含本设备自己的动作确认）。
//! 撤销时若此后外部推进的版本数超过容忍度，拒绝撤销并返回 `StaleUndo`，记录保留。

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::config::UndoConfig;
use crate::error::{FlowSyncError, Result};
use crate::storage::entities::Project;
use crate::utils::time::now_millis;

#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub project_id: String,
    pub before: Project,
    pub after: Project,
    /// 记录时外部推进的累计版本数
    pub remote_version: i64,
    pub created_at: i64,
}

#[derive(Debug, Default)]
struct History {
    /// 队首为最近一次
    undo: VecDeque<UndoEntry>,
    redo: VecDeque<UndoEntry>,
}

pub struct UndoGuard {
    config: UndoConfig,
    histories: Mutex<HashMap<String, History>>,
}

impl UndoGuard {
    pub fn new(config: UndoConfig) -> Self {
        Self {
            config,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次本地变更，新的变更使重做栈失效
    pub fn record(&self, project_id: &str, before: Project, after: Project, remote_version: i64) {
        let mut histories = self.histories.lock();
        let history = histories.entry(project_id.to_string()).or_default();
        history.undo.push_front(UndoEntry {
            project_id: project_id.to_string(),
            before,
            after,
            remote_version,
            created_at: now_millis(),
        });
        history.undo.truncate(self.config.history_size);
        history.redo.clear();
    }

    fn check(&self, entry: &UndoEntry, current_remote_version: i64) -> Result<()> {
        let advanced = current_remote_version - entry.remote_version;
        if advanced > self.config.version_tolerance {
            warn!(
                "⚠️ 拒绝撤销/重做: project={}, 远端已前进 {} 个版本（容忍 {}）",
                entry.project_id, advanced, self.config.version_tolerance
            );
            return Err(FlowSyncError::StaleUndo {
                advanced,
                tolerance: self.config.version_tolerance,
            });
        }
        Ok(())
    }

    /// 撤销最近一次变更，返回应恢复的项目状态
    pub fn undo(&self, project_id: &str, current_remote_version: i64) -> Result<Project> {
        let mut histories = self.histories.lock();
        let history = histories
            .get_mut(project_id)
            .filter(|h| !h.undo.is_empty())
            .ok_or_else(|| FlowSyncError::InvalidOperation(format!("项目 {} 没有可撤销的操作", project_id)))?;

        if let Some(entry) = history.undo.front() {
            self.check(entry, current_remote_version)?;
        }
        let Some(entry) = history.undo.pop_front() else {
            return Err(FlowSyncError::InvalidOperation(format!("项目 {} 没有可撤销的操作", project_id)));
        };
        let restored = entry.before.clone();
        history.redo.push_front(entry);
        history.redo.truncate(self.config.history_size);
        debug!("↩️ 撤销: project={}", project_id);
        Ok(restored)
    }

    /// 重做最近一次撤销
    pub fn redo(&self, project_id: &str, current_remote_version: i64) -> Result<Project> {
        let mut histories = self.histories.lock();
        let history = histories
            .get_mut(project_id)
            .filter(|h| !h.redo.is_empty())
            .ok_or_else(|| FlowSyncError::InvalidOperation(format!("项目 {} 没有可重做的操作", project_id)))?;

        if let Some(entry) = history.redo.front() {
            self.check(entry, current_remote_version)?;
        }
        let Some(entry) = history.redo.pop_front() else {
            return Err(FlowSyncError::InvalidOperation(format!("项目 {} 没有可重做的操作", project_id)));
        };
        let restored = entry.after.clone();
        history.undo.push_front(entry);
        debug!("↪️ 重做: project={}", project_id);
        Ok(restored)
    }

    /// 采用远端状态后清空项目历史
    pub fn clear_project(&self, project_id: &str) {
        self.histories.lock().remove(project_id);
    }

    pub fn can_undo(&self, project_id: &str) -> bool {
        self.histories
            .lock()
            .get(project_id)
            .map(|h| !h.undo.is_empty())
            .unwrap_or(false)
    }

    pub fn can_redo(&self, project_id: &str) -> bool {
        self.histories
            .lock()
            .get(project_id)
            .map(|h| !h.redo.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Project {
        Project::new("p1", name, 1)
    }

    fn guard() -> UndoGuard {
        UndoGuard::new(UndoConfig {
            history_size: 3,
            version_tolerance: 5,
        })
    }

    #[test]
    fn test_undo_redo_cycle() {
        let guard = guard();
        guard.record("p1", named("a"), named("b"), 0);
        guard.record("p1", named("b"), named("c"), 0);

        assert_eq!(guard.undo("p1", 0).unwrap().name, "b");
        assert_eq!(guard.undo("p1", 0).unwrap().name, "a");
        assert!(!guard.can_undo("p1"));
        assert_eq!(guard.redo("p1", 0).unwrap().name, "b");

        // 新变更清空重做栈
        guard.record("p1", named("b"), named("x"), 0);
        assert!(!guard.can_redo("p1"));
    }

    #[test]
    fn test_stale_undo_is_rejected_and_kept() {
        let guard = guard();
        guard.record("p1", named("a"), named("b"), 2);

        let err = guard.undo("p1", 8).unwrap_err();
        assert!(matches!(err, FlowSyncError::StaleUndo { advanced: 6, tolerance: 5 }));
        assert!(guard.can_undo("p1"));

        assert_eq!(guard.undo("p1", 7).unwrap().name, "a");
    }

    #[test]
    fn test_history_is_bounded() {
        let guard = guard();
        for i in 0..5 {
            guard.record("p1", named(&format!("{}", i)), named(&format!("{}", i + 1)), 0);
        }
        for _ in 0..3 {
            guard.undo("p1", 0).unwrap();
        }
        assert!(matches!(guard.undo("p1", 0), Err(FlowSyncError::InvalidOperation(_))));
    }
}
