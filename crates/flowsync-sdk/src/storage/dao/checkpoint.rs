//! 项目检查点 DAO - project_checkpoints 表
//!
//! payload 为 bincode 编码的 Project，digest 为 payload 的 sha256，
//! 读取时校验，损坏的检查点直接跳过。

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::entities::{Project, ProjectCheckpoint};

pub struct CheckpointDao<'a> {
    conn: &'a Connection,
}

pub fn digest_of(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

impl<'a> CheckpointDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, project: &Project, saved_at: i64) -> Result<String> {
        let payload = bincode::serialize(project)?;
        let digest = digest_of(&payload);
        self.conn.execute(
            r#"INSERT INTO project_checkpoints (project_id, payload, digest, version, updated_at, saved_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(project_id) DO UPDATE SET
                   payload = excluded.payload,
                   digest = excluded.digest,
                   version = excluded.version,
                   updated_at = excluded.updated_at,
                   saved_at = excluded.saved_at"#,
            params![project.id, payload, digest, project.version, project.updated_at, saved_at],
        )?;
        Ok(digest)
    }

    /// 删除不在 keep 列表中的检查点
    pub fn retain(&self, keep: &[String]) -> Result<usize> {
        let mut stmt = self.conn.prepare("SELECT project_id FROM project_checkpoints")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        let mut removed = 0;
        for id in ids.iter().filter(|id| !keep.contains(id)) {
            removed += self
                .conn
                .execute("DELETE FROM project_checkpoints WHERE project_id = ?1", params![id])?;
        }
        Ok(removed)
    }

    pub fn list_all(&self) -> Result<Vec<ProjectCheckpoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, payload, digest, saved_at FROM project_checkpoints ORDER BY project_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let project_id: String = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            let digest: String = row.get(2)?;
            if digest_of(&payload) != digest {
                tracing::warn!("⚠️ 检查点校验失败，跳过: project_id={}", project_id);
                continue;
            }
            match bincode::deserialize::<Project>(&payload) {
                Ok(project) => out.push(ProjectCheckpoint {
                    project,
                    digest,
                    saved_at: row.get(3)?,
                }),
                Err(e) => tracing::warn!("⚠️ 检查点解码失败，跳过: project_id={}, {}", project_id, e),
            }
        }
        Ok(out)
    }
}
