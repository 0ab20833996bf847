//! SQLite 存储模块
//!
//! 每个用户一个数据库文件，保存：
//! - 动作队列（含死信）
//! - 乐观快照
//! - 冲突解决记录
//! - 项目检查点

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{FlowSyncError, Result};
use crate::storage::migrate;

/// SQLite 存储组件
#[derive(Debug)]
pub struct SqliteStore {
    /// None 表示内存数据库
    db_path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并执行迁移
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FlowSyncError::IO(format!("创建数据库目录失败: {}", e)))?;
        }
        let mut conn = Connection::open(db_path)
            .map_err(|e| FlowSyncError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;

        tracing::info!("✅ 数据库初始化完成: {}", db_path.display());
        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存数据库（存储降级或测试时使用）
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| FlowSyncError::Database(format!("打开内存数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        Ok(Self {
            db_path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    /// 在连接上执行一组同步操作
    pub async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// 在事务中执行，失败时回滚
    pub async fn with_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<R>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
