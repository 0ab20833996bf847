//! 数据访问层 (DAO) - 每张表一个专门的操作模块

pub mod action;
pub mod checkpoint;
pub mod conflict;
pub mod snapshot;

pub use action::ActionDao;
pub use checkpoint::CheckpointDao;
pub use conflict::ConflictDao;
pub use snapshot::SnapshotDao;

#[cfg(test)]
pub(crate) fn test_conn() -> rusqlite::Connection {
    let mut conn = rusqlite::Connection::open_in_memory().unwrap();
    crate::storage::migrate::init_db(&mut conn).unwrap();
    conn
}
