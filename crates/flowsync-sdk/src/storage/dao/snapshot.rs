//! 快照 DAO - snapshots 表

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::entities::{Project, SnapshotRecord};

pub struct SnapshotDao<'a> {
    conn: &'a Connection,
}

impl<'a> SnapshotDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let prior = serde_json::to_string(&snapshot.prior_state)?;
        self.conn.execute(
            r#"INSERT OR REPLACE INTO snapshots (snapshot_id, project_id, prior_state, created_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![snapshot.id, snapshot.project_id, prior, snapshot.created_at],
        )?;
        Ok(())
    }

    pub fn delete(&self, snapshot_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM snapshots WHERE snapshot_id = ?1", params![snapshot_id])?;
        Ok(n > 0)
    }

    pub fn delete_many(&self, snapshot_ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in snapshot_ids {
            removed += self
                .conn
                .execute("DELETE FROM snapshots WHERE snapshot_id = ?1", params![id])?;
        }
        Ok(removed)
    }

    /// 按创建时间升序加载
    pub fn list_all(&self) -> Result<Vec<SnapshotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, project_id, prior_state, created_at FROM snapshots ORDER BY created_at ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_snapshot(row)?);
        }
        Ok(out)
    }
}

fn row_to_snapshot(row: &rusqlite::Row) -> Result<SnapshotRecord> {
    let prior: String = row.get(2)?;
    let prior_state: Project = serde_json::from_str(&prior)?;
    Ok(SnapshotRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        prior_state,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_conn;

    #[test]
    fn test_insert_list_delete() {
        let conn = test_conn();
        let dao = SnapshotDao::new(&conn);
        let record = SnapshotRecord {
            id: "s1".into(),
            project_id: "p1".into(),
            prior_state: Project::new("p1", "Roadmap", 5),
            created_at: 100,
        };
        dao.insert(&record).unwrap();
        assert_eq!(dao.list_all().unwrap(), vec![record]);
        assert_eq!(dao.delete_many(&["s1".to_string(), "s2".to_string()]).unwrap(), 1);
        assert!(dao.list_all().unwrap().is_empty());
    }
}
