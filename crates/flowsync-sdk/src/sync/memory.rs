//! 进程内远端实现
//!
//! 行为与真实后端一致：按动作 ID 去重、每次应用版本号加一、校验失败返回 422。
//! 支持注入失败、延迟与不可达状态，用于离线演示和测试。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::transport::{RemoteAck, RemoteTransport};
use crate::error::{FlowSyncError, ErrorClass, Result};
use crate::presence::DeviceHeartbeat;
use crate::storage::entities::Project;
use crate::storage::queue::{Mutation, QueuedAction};

#[derive(Debug, Default)]
struct MemoryState {
    projects: HashMap<String, Project>,
    /// action_id -> 首次应用的结果
    applied: HashMap<String, RemoteAck>,
    heartbeats: Vec<DeviceHeartbeat>,
}

#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    failures: Mutex<VecDeque<FlowSyncError>>,
    latency: Mutex<Option<Duration>>,
    reachable: AtomicBool,
    apply_calls: AtomicU64,
    load_calls: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            reachable: AtomicBool::new(true),
            apply_calls: AtomicU64::new(0),
            load_calls: AtomicU64::new(0),
        }
    }

    /// 直接写入远端项目（模拟其他设备的修改）
    pub fn put_project(&self, project: Project) {
        self.state.lock().projects.insert(project.id.clone(), project);
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.state.lock().projects.get(project_id).cloned()
    }

    /// 下一次远端调用返回指定错误（按注入顺序消费）
    pub fn fail_next(&self, error: FlowSyncError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> u64 {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> Vec<DeviceHeartbeat> {
        self.state.lock().heartbeats.clone()
    }

    async fn gate(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(FlowSyncError::Network("remote unreachable".to_string()));
        }
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self.failures.lock().pop_front();
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn load_projects(&self, _user_id: &str) -> Result<Vec<Project>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let mut projects: Vec<Project> = self.state.lock().projects.values().cloned().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn apply_action(&self, action: &QueuedAction) -> Result<RemoteAck> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let mut state = self.state.lock();
        if let Some(ack) = state.applied.get(&action.id) {
            return Ok(ack.clone());
        }

        let mut project = match (state.projects.get(&action.project_id), &action.payload) {
            (Some(existing), _) => existing.clone(),
            (None, Mutation::SaveProject(saved)) => saved.clone(),
            (None, _) => Project::new(&action.project_id, &action.project_id, action.created_at),
        };
        let base_version = project.version;
        if let Err(e) = action.payload.apply(&mut project) {
            return Err(match e.class() {
                ErrorClass::Validation => FlowSyncError::remote(422, e.to_string()),
                _ => e,
            });
        }
        project.version = base_version.max(project.version) + 1;

        let ack = RemoteAck {
            project_id: project.id.clone(),
            version: project.version,
            updated_at: project.updated_at,
        };
        state.projects.insert(project.id.clone(), project);
        state.applied.insert(action.id.clone(), ack.clone());
        Ok(ack)
    }

    async fn ping(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FlowSyncError::Network("remote unreachable".to_string()))
        }
    }

    async fn publish_heartbeat(&self, heartbeat: &DeviceHeartbeat) -> Result<()> {
        self.gate().await?;
        self.state.lock().heartbeats.push(heartbeat.clone());
        Ok(())
    }
}
