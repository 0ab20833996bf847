//! FlowSync SDK - 本地优先的项目/任务数据同步引擎
//!
//! 本 SDK 在不可靠网络、多设备并发编辑与本地乐观更新之下，
//! 保持设备本地副本与远端权威存储的一致：
//! - 📥 持久化动作队列：按项目 FIFO、指数退避重试、死信
//! - 📸 乐观快照：变更前捕获，确认后丢弃，死信时回滚
//! - 📡 熔断器与重连：连续失败后短路，后台探测恢复
//! - 🔄 同步协调：去抖保存、编辑锁、云端加载与重连合并
//! - ⚔️ 冲突检测与解决：本地 / 远端 / 逐实体合并，解决记录可追溯
//! - ↩️ 撤销/重做：远端版本前进过多时拒绝陈旧撤销
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowsync_sdk::{FlowSyncConfig, FlowSyncSDK, MemoryTransport, Mutation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FlowSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .user_id("user123")
//!         .device_id("laptop")
//!         .build()?;
//!
//!     let sdk = FlowSyncSDK::initialize(config, Arc::new(MemoryTransport::new())).await?;
//!
//!     sdk.on_conflict(|notice| {
//!         println!("项目 {} 出现冲突", notice.project_id);
//!     })
//!     .await;
//!
//!     let outcome = sdk
//!         .enqueue_mutation(
//!             "project-1",
//!             Mutation::RenameProject { name: "Roadmap".into(), updated_at: 0 },
//!         )
//!         .await;
//!     println!("入队成功: {}", outcome.is_success());
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod presence;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

pub use config::{FlowSyncConfig, FlowSyncConfigBuilder};
pub use error::{ErrorClass, FlowSyncError, Result, SyncOutcome};
pub use events::{EventFilter, EventManager, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{BreakerState, CircuitBreaker, NetworkMonitor, NetworkStatus, ReconnectionManager};
pub use presence::{DeviceHeartbeat, PresenceManager};
pub use sdk::{ConflictNotice, FlowSyncSDK, SdkStats};
pub use storage::entities::{ConflictRecord, ConflictStrategy, Project, Task, TaskConnection};
pub use storage::queue::{ActionKind, ActionQueue, Mutation, QueuedAction, TextField};
pub use storage::StorageManager;
pub use sync::{
    LoadResult, MemoryTransport, PushOutcome, RemoteAck, RemoteTransport, SnapshotTracker, SyncCoordinator,
};
pub use version::SDK_VERSION;
