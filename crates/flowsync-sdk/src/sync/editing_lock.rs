//! 编辑锁
//!
//! 用户正在编辑某个项目时，远端推送先暂存，编辑结束或锁超时后再处理，
//! 避免远端状态在输入过程中覆盖界面。每个项目只保留版本最高的一次推送。

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::storage::entities::Project;
use crate::utils::DeferredTask;

pub struct EditingLocks {
    timeout: Duration,
    expiries: Mutex<HashMap<String, Arc<DeferredTask>>>,
    active: Arc<Mutex<HashSet<String>>>,
    buffered: Mutex<HashMap<String, Project>>,
    /// 锁释放（主动或超时）的项目 ID
    released: mpsc::UnboundedSender<String>,
}

impl EditingLocks {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (released, rx) = mpsc::unbounded_channel();
        let locks = Self {
            timeout,
            expiries: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
            buffered: Mutex::new(HashMap::new()),
            released,
        };
        (locks, rx)
    }

    /// 获取或续期编辑锁
    pub fn touch(&self, project_id: &str) {
        self.active.lock().insert(project_id.to_string());
        let expiry = self
            .expiries
            .lock()
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(DeferredTask::new(format!("editing-lock:{}", project_id))))
            .clone();

        let active = self.active.clone();
        let released = self.released.clone();
        let pid = project_id.to_string();
        expiry.arm(self.timeout, async move {
            active.lock().remove(&pid);
            debug!("编辑锁超时: project={}", pid);
            let _ = released.send(pid);
        });
    }

    /// 主动释放，返回之前是否持有锁
    pub fn release(&self, project_id: &str) -> bool {
        if let Some(expiry) = self.expiries.lock().get(project_id) {
            expiry.cancel();
        }
        let was_locked = self.active.lock().remove(project_id);
        if self.buffered.lock().contains_key(project_id) {
            let _ = self.released.send(project_id.to_string());
        }
        was_locked
    }

    pub fn is_locked(&self, project_id: &str) -> bool {
        self.active.lock().contains(project_id)
    }

    /// 暂存远端推送，返回该推送是否被保留
    pub fn buffer(&self, project: Project) -> bool {
        let mut buffered = self.buffered.lock();
        match buffered.get(&project.id) {
            Some(existing) if existing.version >= project.version => false,
            _ => {
                buffered.insert(project.id.clone(), project);
                true
            }
        }
    }

    pub fn take_buffered(&self, project_id: &str) -> Option<Project> {
        self.buffered.lock().remove(project_id)
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(v: i64) -> Project {
        let mut project = Project::new("p1", "Roadmap", 1);
        project.version = v;
        project
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_and_reports() {
        let (locks, mut rx) = EditingLocks::new(Duration::from_secs(2));
        locks.touch("p1");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        locks.touch("p1");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(locks.is_locked("p1"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!locks.is_locked("p1"));
        assert_eq!(rx.recv().await.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_buffer_keeps_newest_and_release_reports() {
        let (locks, mut rx) = EditingLocks::new(Duration::from_secs(60));
        locks.touch("p1");
        assert!(locks.buffer(version(7)));
        assert!(!locks.buffer(version(6)));
        assert!(locks.buffer(version(9)));
        assert_eq!(locks.buffered_count(), 1);

        assert!(locks.release("p1"));
        assert_eq!(rx.recv().await.as_deref(), Some("p1"));
        assert_eq!(locks.take_buffered("p1").unwrap().version, 9);
        assert!(locks.take_buffered("p1").is_none());
    }
}
