//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块保存体量小、读写频繁的同步元数据：
//! - 每个项目的同步基线（最近确认的远端版本）
//! - 运行标记（上次同步时间等）
//! - 功能开关（未设置时视为关闭）
//! - 用户隔离的命名空间（每个用户一个 Tree）

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{FlowSyncError, Result};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    /// None 表示临时库（存储降级或测试）
    base_path: Option<PathBuf>,
    db: Arc<Db>,
    /// 用户专属的 Tree 实例
    user_trees: Arc<RwLock<HashMap<String, Tree>>>,
    current_user: Arc<RwLock<Option<String>>>,
}

impl KvStore {
    /// 在 `{base_path}/kv` 下打开 sled 数据库
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FlowSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 切换账号后旧实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    return Ok(Self::from_db(Some(base_path.to_path_buf()), db));
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    tracing::debug!("🔄 sled 文件锁被占用，{}ms 后重试", delay_ms);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
        Err(FlowSyncError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 临时 KV 库，进程退出即丢弃
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FlowSyncError::KvStore(format!("打开临时 sled 数据库失败: {}", e)))?;
        Ok(Self::from_db(None, db))
    }

    fn from_db(base_path: Option<PathBuf>, db: Db) -> Self {
        Self {
            base_path,
            db: Arc::new(db),
            user_trees: Arc::new(RwLock::new(HashMap::new())),
            current_user: Arc::new(RwLock::new(None)),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.base_path.is_none()
    }

    /// 初始化用户 Tree
    pub async fn init_user_tree(&self, uid: &str) -> Result<()> {
        let tree = self
            .db
            .open_tree(format!("user_{}", uid))
            .map_err(|e| FlowSyncError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;
        self.user_trees.write().await.insert(uid.to_string(), tree);
        tracing::debug!("用户 KV Tree 初始化完成: {}", uid);
        Ok(())
    }

    /// 切换用户，Tree 不存在时先初始化
    pub async fn switch_user(&self, uid: &str) -> Result<()> {
        let exists = self.user_trees.read().await.contains_key(uid);
        if !exists {
            self.init_user_tree(uid).await?;
        }
        *self.current_user.write().await = Some(uid.to_string());
        Ok(())
    }

    async fn current_tree(&self) -> Result<Tree> {
        let current_user = self.current_user.read().await;
        let uid = current_user
            .as_ref()
            .ok_or_else(|| FlowSyncError::NotInitialized("KV 存储未选择用户".to_string()))?;
        let user_trees = self.user_trees.read().await;
        user_trees
            .get(uid)
            .cloned()
            .ok_or_else(|| FlowSyncError::KvStore("用户 Tree 不存在".to_string()))
    }

    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.current_tree().await?;
        let bytes = serde_json::to_vec(value)
            .map_err(|e| FlowSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        tree.insert(key, bytes)
            .map_err(|e| FlowSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await?;
        let result = tree
            .get(key)
            .map_err(|e| FlowSyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| FlowSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        let removed = tree
            .remove(key)
            .map_err(|e| FlowSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        tree.contains_key(key)
            .map_err(|e| FlowSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 获取指定前缀的所有键值对，键去掉前缀后以字符串返回
    pub async fn scan_prefix<V>(&self, prefix: &str) -> Result<Vec<(String, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await?;
        let mut results = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) =
                item.map_err(|e| FlowSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| FlowSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
            let key = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            results.push((key, value));
        }
        Ok(results)
    }

    /// 删除指定前缀的所有键
    pub async fn clear_prefix(&self, prefix: &str) -> Result<usize> {
        let tree = self.current_tree().await?;
        let mut removed = 0;
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) =
                item.map_err(|e| FlowSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            tree.remove(key)
                .map_err(|e| FlowSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// 读取功能开关，未设置返回 None
    pub async fn get_feature_flag(&self, name: &str) -> Result<Option<bool>> {
        self.get(format!("{}{}", keys::FEATURE_FLAG, name)).await
    }

    pub async fn set_feature_flag(&self, name: &str, enabled: bool) -> Result<()> {
        self.set(format!("{}{}", keys::FEATURE_FLAG, name), &enabled)
            .await?;
        tracing::debug!("功能开关 {} = {}", name, enabled);
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FlowSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 常用的键前缀常量
pub mod keys {
    /// 项目同步基线前缀（后接 project_id）
    pub const BASELINE: &str = "baseline_";
    /// 上次成功从远端加载的时间
    pub const LAST_REMOTE_LOAD: &str = "last_remote_load";
    /// 上次写检查点的时间
    pub const LAST_CHECKPOINT: &str = "last_checkpoint";
    /// 功能开关前缀（后接开关名）
    pub const FEATURE_FLAG: &str = "flag_";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::SyncBaseline;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        store.switch_user("u1").await.unwrap();

        let baseline = SyncBaseline { version: 7, updated_at: 1000 };
        store.set("baseline_p1", &baseline).await.unwrap();
        let loaded: SyncBaseline = store.get("baseline_p1").await.unwrap().unwrap();
        assert_eq!(loaded, baseline);

        assert!(store.exists("baseline_p1").await.unwrap());
        assert!(store.delete("baseline_p1").await.unwrap());
        let gone: Option<SyncBaseline> = store.get("baseline_p1").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_prefix_scan_is_user_scoped() {
        let store = KvStore::temporary().unwrap();
        store.switch_user("u1").await.unwrap();
        for (key, value) in [("baseline_a", 1i64), ("baseline_b", 2i64), ("other", 3i64)] {
            store.set(key, &value).await.unwrap();
        }

        let mut found: Vec<(String, i64)> = store.scan_prefix(keys::BASELINE).await.unwrap();
        found.sort();
        assert_eq!(found, vec![("a".to_string(), 1), ("b".to_string(), 2)]);

        store.switch_user("u2").await.unwrap();
        let empty: Vec<(String, i64)> = store.scan_prefix(keys::BASELINE).await.unwrap();
        assert!(empty.is_empty());

        store.switch_user("u1").await.unwrap();
        assert_eq!(store.clear_prefix(keys::BASELINE).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_feature_flags_persist_per_user() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = KvStore::new(temp_dir.path()).await.unwrap();
            store.switch_user("u1").await.unwrap();
            assert_eq!(store.get_feature_flag("presence").await.unwrap(), None);

            store.set_feature_flag("presence", true).await.unwrap();
            store.set_feature_flag("undo", false).await.unwrap();
            assert_eq!(store.get_feature_flag("presence").await.unwrap(), Some(true));
            assert_eq!(store.get_feature_flag("undo").await.unwrap(), Some(false));

            store.switch_user("u2").await.unwrap();
            assert_eq!(store.get_feature_flag("presence").await.unwrap(), None);
            store.flush().await.unwrap();
        }

        let reopened = KvStore::new(temp_dir.path()).await.unwrap();
        reopened.switch_user("u1").await.unwrap();
        assert_eq!(reopened.get_feature_flag("presence").await.unwrap(), Some(true));
        // 开关与基线共用 Tree，互不干扰
        let baselines: Vec<(String, i64)> = reopened.scan_prefix(keys::BASELINE).await.unwrap();
        assert!(baselines.is_empty());
    }

    #[tokio::test]
    async fn test_requires_user() {
        let store = KvStore::temporary().unwrap();
        assert!(store.set("k", &1).await.is_err());
    }
}
