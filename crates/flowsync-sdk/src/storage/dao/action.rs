//! 动作队列 DAO - queued_actions 表
//!
//! 整个 QueuedAction 以 JSON 存在 data 列；seq 自增列保证项目内 FIFO 顺序，
//! upsert 时保留原 seq。

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::queue::action::QueuedAction;

pub struct ActionDao<'a> {
    conn: &'a Connection,
}

impl<'a> ActionDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, action: &QueuedAction) -> Result<()> {
        let data = serde_json::to_string(action)?;
        let sql = r#"
            INSERT INTO queued_actions (action_id, project_id, kind, data, attempt, dead_letter, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(action_id) DO UPDATE SET
                project_id = excluded.project_id,
                kind = excluded.kind,
                data = excluded.data,
                attempt = excluded.attempt,
                dead_letter = excluded.dead_letter,
                updated_at = excluded.updated_at
        "#;
        self.conn.execute(
            sql,
            params![
                action.id,
                action.project_id,
                action.kind.as_str(),
                data,
                action.attempt,
                action.dead_letter as i32,
                action.created_at,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, action_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM queued_actions WHERE action_id = ?1", params![action_id])?;
        Ok(n > 0)
    }

    pub fn delete_by_project(&self, project_id: &str) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM queued_actions WHERE project_id = ?1 AND dead_letter = 0",
            params![project_id],
        )?;
        Ok(n)
    }

    pub fn get(&self, action_id: &str) -> Result<Option<QueuedAction>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM queued_actions WHERE action_id = ?1")?;
        let mut rows = stmt.query(params![action_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_action(row)?)),
            None => Ok(None),
        }
    }

    /// 按入队顺序加载全部动作（含死信）
    pub fn list_all(&self) -> Result<Vec<QueuedAction>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM queued_actions ORDER BY seq ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_action(row)?);
        }
        Ok(out)
    }

    pub fn count_pending(&self) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM queued_actions WHERE dead_letter = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_action(row: &rusqlite::Row) -> Result<QueuedAction> {
    let data: String = row.get(0)?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_conn;
    use crate::storage::queue::action::Mutation;

    #[test]
    fn test_upsert_keeps_fifo_position() {
        let conn = test_conn();
        let dao = ActionDao::new(&conn);

        let first = QueuedAction::new("p1", Mutation::RenameProject { name: "a".into(), updated_at: 1 });
        let second = QueuedAction::new("p1", Mutation::DeleteProject { deleted_at: 2 });
        dao.upsert(&first).unwrap();
        dao.upsert(&second).unwrap();

        let mut retried = first.clone();
        retried.attempt = 3;
        dao.upsert(&retried).unwrap();

        let all = dao.list_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[0].attempt, 3);
        assert_eq!(dao.count_pending().unwrap(), 2);

        assert!(dao.delete(&first.id).unwrap());
        assert!(!dao.delete(&first.id).unwrap());
        assert!(dao.get(&second.id).unwrap().is_some());
    }
}
