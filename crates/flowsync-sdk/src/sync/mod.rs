//! 同步模块
//!
//! - `transport` / `memory` / `remote`：远端边界、进程内实现与熔断/超时保护
//! - `snapshot`：乐观快照
//! - `merge`：逐实体合并、变基与列表对账
//! - `conflict`：冲突检测与解决记录
//! - `undo`：撤销/重做版本保护
//! - `editing_lock`：编辑期间暂存远端推送
//! - `coordinator`：把以上组件串起来的同步协调器

pub mod conflict;
pub mod coordinator;
pub mod editing_lock;
pub mod memory;
pub mod merge;
pub mod remote;
pub mod snapshot;
pub mod transport;
pub mod undo;

pub use conflict::{ConflictDetector, ConflictResolver, Detection, PendingConflict};
pub use coordinator::{CoordinatorParts, ExportDocument, LoadResult, PushOutcome, SyncCoordinator};
pub use editing_lock::EditingLocks;
pub use memory::MemoryTransport;
pub use merge::{merge_projects, rebase, reconcile_project};
pub use remote::GuardedRemote;
pub use snapshot::{EvictionReason, RollbackOutcome, SnapshotTracker, SweepReport};
pub use transport::{RemoteAck, RemoteTransport, TransportPing};
pub use undo::{UndoEntry, UndoGuard};
