//! 冲突 DAO - conflict_records 表（解决记录）与 pending_conflicts 表（未解决冲突）

use rusqlite::{params, Connection};

use crate::error::{FlowSyncError, Result};
use crate::storage::entities::{ConflictRecord, ConflictStrategy, PendingConflict};

pub struct ConflictDao<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &ConflictRecord) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO conflict_records (record_id, project_id, local_version, remote_version, resolution, created_at, archived)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                record.id,
                record.project_id,
                record.local_version,
                record.remote_version,
                record.resolution.as_str(),
                record.timestamp,
                record.archived as i32,
            ],
        )?;
        Ok(())
    }

    /// 未归档记录，按时间倒序
    pub fn list_active(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT record_id, project_id, local_version, remote_version, resolution, created_at, archived
               FROM conflict_records WHERE archived = 0 ORDER BY created_at DESC LIMIT ?1"#,
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_record(row)?);
        }
        Ok(out)
    }

    /// 归档早于 cutoff 的记录
    pub fn archive_before(&self, cutoff: i64) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE conflict_records SET archived = 1 WHERE archived = 0 AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    /// 未归档记录超出 keep 条的部分归档
    pub fn archive_overflow(&self, keep: usize) -> Result<usize> {
        let n = self.conn.execute(
            r#"UPDATE conflict_records SET archived = 1
               WHERE archived = 0 AND record_id NOT IN (
                   SELECT record_id FROM conflict_records WHERE archived = 0
                   ORDER BY created_at DESC LIMIT ?1
               )"#,
            params![keep as i64],
        )?;
        Ok(n)
    }

    // ========== 未解决冲突 ==========

    /// 每个项目最多一条，重复登记时覆盖
    pub fn upsert_pending(&self, conflict: &PendingConflict) -> Result<()> {
        let data = serde_json::to_string(conflict)?;
        self.conn.execute(
            r#"INSERT INTO pending_conflicts (project_id, conflict_id, data, raised_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(project_id) DO UPDATE SET
                   conflict_id = excluded.conflict_id,
                   data = excluded.data"#,
            params![conflict.project_id, conflict.id, data, conflict.raised_at],
        )?;
        Ok(())
    }

    pub fn delete_pending(&self, project_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM pending_conflicts WHERE project_id = ?1", params![project_id])?;
        Ok(n > 0)
    }

    /// 按登记时间加载全部未解决冲突
    pub fn list_pending(&self) -> Result<Vec<PendingConflict>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM pending_conflicts ORDER BY raised_at ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }
}

fn row_to_record(row: &rusqlite::Row) -> Result<ConflictRecord> {
    let resolution: String = row.get(4)?;
    let resolution = ConflictStrategy::parse(&resolution)
        .ok_or_else(|| FlowSyncError::Database(format!("未知的冲突解决策略: {}", resolution)))?;
    Ok(ConflictRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        local_version: row.get(2)?,
        remote_version: row.get(3)?,
        resolution,
        timestamp: row.get(5)?,
        archived: row.get::<_, i32>(6)? != 0,
    })
}
