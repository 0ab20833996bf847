//! 存储模块 - 同步引擎的本地持久化层
//!
//! 采用分层架构设计：
//! - StorageManager: 统一的存储管理器，提供领域 API
//! - DAO Layer: 每张表一个专门的操作模块
//! - Entities: 同步实体定义
//! - KV: 同步基线等元数据
//! - Queue: 持久化动作队列
//!
//! 目录布局：`{data_dir}/users/{uid}/flowsync.db` 与 `{data_dir}/users/{uid}/kv/`。
//! 本地存储不可用时降级为内存存储，引擎继续工作，但重启后数据不保留。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{FlowSyncError, Result};
use crate::utils::time::now_millis;

pub mod dao;
pub mod entities;
pub mod kv;
pub mod migrate;
pub mod queue;
pub mod sqlite;

pub use entities::*;
pub use kv::KvStore;
pub use sqlite::SqliteStore;

use dao::{ActionDao, CheckpointDao, ConflictDao, SnapshotDao};
use queue::action::QueuedAction;

/// 存储统计信息
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStats {
    pub pending_actions: i64,
    pub snapshots: usize,
    pub checkpoints: usize,
    pub write_failures: u64,
    pub degraded: bool,
}

/// 存储管理器 - 统一的数据访问接口
///
/// 外部不直接接触 SQLite / sled，只通过领域 API 读写。
#[derive(Debug)]
pub struct StorageManager {
    /// None 表示纯内存模式
    base_path: Option<PathBuf>,
    current_user: RwLock<Option<String>>,
    kv: RwLock<Option<Arc<KvStore>>>,
    sqlite: RwLock<Option<Arc<SqliteStore>>>,
    degraded: AtomicBool,
    degraded_reason: Mutex<Option<String>>,
    write_failures: AtomicU64,
}

impl StorageManager {
    /// 创建存储管理器，数据写入 `base_path`
    pub async fn new(base_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_path)
            .await
            .map_err(|e| FlowSyncError::IO(format!("创建存储目录失败: {}", e)))?;
        Ok(Self::with_base(Some(base_path.to_path_buf())))
    }

    /// 纯内存存储管理器
    pub fn in_memory() -> Self {
        Self::with_base(None)
    }

    fn with_base(base_path: Option<PathBuf>) -> Self {
        Self {
            base_path,
            current_user: RwLock::new(None),
            kv: RwLock::new(None),
            sqlite: RwLock::new(None),
            degraded: AtomicBool::new(false),
            degraded_reason: Mutex::new(None),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn user_dir(&self, uid: &str) -> Option<PathBuf> {
        self.base_path.as_ref().map(|base| base.join("users").join(uid))
    }

    /// 初始化用户存储（幂等）
    pub async fn init_user(&self, uid: &str) -> Result<()> {
        if self.current_user.read().await.as_deref() == Some(uid) && self.sqlite.read().await.is_some() {
            return Ok(());
        }

        let (kv, sqlite) = match self.user_dir(uid) {
            Some(user_dir) => {
                let kv = KvStore::new(&user_dir).await?;
                let sqlite = SqliteStore::open(&user_dir.join("flowsync.db")).await?;
                (kv, sqlite)
            }
            None => (KvStore::temporary()?, SqliteStore::open_in_memory()?),
        };
        kv.switch_user(uid).await?;

        *self.kv.write().await = Some(Arc::new(kv));
        *self.sqlite.write().await = Some(Arc::new(sqlite));
        *self.current_user.write().await = Some(uid.to_string());
        tracing::info!("✅ 用户存储初始化完成: {}", uid);
        Ok(())
    }

    /// 初始化用户存储，失败时降级为内存存储
    ///
    /// 返回降级原因（None 表示使用持久化存储）。
    pub async fn init_user_or_degrade(&self, uid: &str) -> Result<Option<String>> {
        match self.init_user(uid).await {
            Ok(()) => Ok(None),
            Err(e) => {
                let reason = format!("本地存储不可用，降级为内存存储: {}", e);
                tracing::error!("❌ {}", reason);
                let kv = KvStore::temporary()?;
                kv.switch_user(uid).await?;
                *self.kv.write().await = Some(Arc::new(kv));
                *self.sqlite.write().await = Some(Arc::new(SqliteStore::open_in_memory()?));
                *self.current_user.write().await = Some(uid.to_string());
                self.mark_degraded(&reason);
                Ok(Some(reason))
            }
        }
    }

    pub async fn current_user(&self) -> Option<String> {
        self.current_user.read().await.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn degraded_reason(&self) -> Option<String> {
        self.degraded_reason.lock().clone()
    }

    pub fn mark_degraded(&self, reason: &str) {
        self.degraded.store(true, Ordering::SeqCst);
        *self.degraded_reason.lock() = Some(reason.to_string());
    }

    /// 记录一次持久化写入失败；内存状态保持可用
    pub fn note_write_failure(&self, what: &str, error: &FlowSyncError) {
        let count = self.write_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::error!("❌ 持久化失败 ({}): {}，累计 {} 次", what, error, count);
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::SeqCst)
    }

    async fn sqlite(&self) -> Result<Arc<SqliteStore>> {
        self.sqlite
            .read()
            .await
            .clone()
            .ok_or_else(|| FlowSyncError::NotInitialized("用户存储未初始化".to_string()))
    }

    async fn kv(&self) -> Result<Arc<KvStore>> {
        self.kv
            .read()
            .await
            .clone()
            .ok_or_else(|| FlowSyncError::NotInitialized("用户存储未初始化".to_string()))
    }

    // ========== 动作队列 ==========

    pub async fn save_action(&self, action: &QueuedAction) -> Result<()> {
        self.sqlite()
            .await?
            .with_conn(|conn| ActionDao::new(conn).upsert(action))
            .await
    }

    pub async fn delete_action(&self, action_id: &str) -> Result<bool> {
        self.sqlite()
            .await?
            .with_conn(|conn| ActionDao::new(conn).delete(action_id))
            .await
    }

    pub async fn delete_project_actions(&self, project_id: &str) -> Result<usize> {
        self.sqlite()
            .await?
            .with_conn(|conn| ActionDao::new(conn).delete_by_project(project_id))
            .await
    }

    /// 按入队顺序加载全部动作（含死信）
    pub async fn load_actions(&self) -> Result<Vec<QueuedAction>> {
        self.sqlite()
            .await?
            .with_conn(|conn| ActionDao::new(conn).list_all())
            .await
    }

    // ========== 乐观快照 ==========

    pub async fn save_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        self.sqlite()
            .await?
            .with_conn(|conn| SnapshotDao::new(conn).insert(snapshot))
            .await
    }

    pub async fn delete_snapshots(&self, snapshot_ids: &[String]) -> Result<usize> {
        if snapshot_ids.is_empty() {
            return Ok(0);
        }
        self.sqlite()
            .await?
            .with_transaction(|tx| SnapshotDao::new(tx).delete_many(snapshot_ids))
            .await
    }

    pub async fn load_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        self.sqlite()
            .await?
            .with_conn(|conn| SnapshotDao::new(conn).list_all())
            .await
    }

    // ========== 冲突记录 ==========

    pub async fn save_pending_conflict(&self, conflict: &PendingConflict) -> Result<()> {
        self.sqlite()
            .await?
            .with_conn(|conn| ConflictDao::new(conn).upsert_pending(conflict))
            .await
    }

    pub async fn load_pending_conflicts(&self) -> Result<Vec<PendingConflict>> {
        self.sqlite()
            .await?
            .with_conn(|conn| ConflictDao::new(conn).list_pending())
            .await
    }

    /// 写入解决记录并移除对应的未解决冲突（同一事务）
    pub async fn resolve_pending_conflict(&self, record: &ConflictRecord) -> Result<()> {
        self.sqlite()
            .await?
            .with_transaction(|tx| {
                let dao = ConflictDao::new(tx);
                dao.insert(record)?;
                dao.delete_pending(&record.project_id)?;
                Ok(())
            })
            .await
    }

    pub async fn conflict_history(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.sqlite()
            .await?
            .with_conn(|conn| ConflictDao::new(conn).list_active(limit))
            .await
    }

    /// 归档过期及超出数量上限的冲突记录
    pub async fn archive_conflicts(&self, cutoff: i64, keep: usize) -> Result<usize> {
        self.sqlite()
            .await?
            .with_transaction(|tx| {
                let dao = ConflictDao::new(tx);
                Ok(dao.archive_before(cutoff)? + dao.archive_overflow(keep)?)
            })
            .await
    }

    // ========== 项目检查点 ==========

    /// 写入全部项目的检查点，并删除已不存在项目的检查点
    pub async fn save_checkpoints(&self, projects: &[Project]) -> Result<usize> {
        let saved_at = now_millis();
        let keep: Vec<String> = projects.iter().map(|p| p.id.clone()).collect();
        self.sqlite()
            .await?
            .with_transaction(|tx| {
                let dao = CheckpointDao::new(tx);
                for project in projects {
                    dao.upsert(project, saved_at)?;
                }
                dao.retain(&keep)?;
                Ok(projects.len())
            })
            .await
    }

    pub async fn load_checkpoints(&self) -> Result<Vec<Project>> {
        let checkpoints = self
            .sqlite()
            .await?
            .with_conn(|conn| CheckpointDao::new(conn).list_all())
            .await?;
        Ok(checkpoints.into_iter().map(|c| c.project).collect())
    }

    // ========== 同步基线 ==========

    pub async fn save_baseline(&self, project_id: &str, baseline: &SyncBaseline) -> Result<()> {
        self.kv()
            .await?
            .set(format!("{}{}", kv::keys::BASELINE, project_id), baseline)
            .await
    }

    pub async fn delete_baseline(&self, project_id: &str) -> Result<bool> {
        self.kv()
            .await?
            .delete(format!("{}{}", kv::keys::BASELINE, project_id))
            .await
    }

    pub async fn load_baselines(&self) -> Result<HashMap<String, SyncBaseline>> {
        let pairs: Vec<(String, SyncBaseline)> =
            self.kv().await?.scan_prefix(kv::keys::BASELINE).await?;
        Ok(pairs.into_iter().collect())
    }

    pub async fn set_marker(&self, key: &str, value: i64) -> Result<()> {
        self.kv().await?.set(key, &value).await
    }

    pub async fn get_marker(&self, key: &str) -> Result<Option<i64>> {
        self.kv().await?.get(key).await
    }

    /// 未设置的开关按关闭处理
    pub async fn feature_flag(&self, name: &str) -> Result<bool> {
        Ok(self
            .kv()
            .await?
            .get_feature_flag(name)
            .await?
            .unwrap_or(false))
    }

    pub async fn set_feature_flag(&self, name: &str, enabled: bool) -> Result<()> {
        self.kv().await?.set_feature_flag(name, enabled).await
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let sqlite = self.sqlite().await?;
        let (pending_actions, snapshots, checkpoints) = sqlite
            .with_conn(|conn| {
                Ok((
                    ActionDao::new(conn).count_pending()?,
                    SnapshotDao::new(conn).list_all()?.len(),
                    CheckpointDao::new(conn).list_all()?.len(),
                ))
            })
            .await?;
        Ok(StorageStats {
            pending_actions,
            snapshots,
            checkpoints,
            write_failures: self.write_failures(),
            degraded: self.is_degraded(),
        })
    }

    /// 关闭前刷盘
    pub async fn flush(&self) -> Result<()> {
        if let Ok(kv) = self.kv().await {
            kv.flush().await?;
        }
        Ok(())
    }
}
