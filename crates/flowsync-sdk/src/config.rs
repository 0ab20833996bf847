//! SDK 配置
//!
//! 所有时间参数以毫秒表示，便于序列化；需要 `Duration` 时通过访问方法获取。
//! 默认值适用于单用户多设备的项目/任务编辑场景。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FlowSyncError, Result, DEFAULT_RETRYABLE_STATUSES};

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSyncConfig {
    /// 数据存储目录（每个用户一个子目录）
    pub data_dir: PathBuf,
    /// 当前用户
    pub user_id: String,
    /// 当前设备标识，用于设备心跳
    pub device_id: String,
    pub sync: SyncConfig,
    pub conflict: ConflictConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub reconnect: ReconnectConfig,
    pub snapshot: SnapshotConfig,
    pub undo: UndoConfig,
    pub timeouts: TimeoutConfig,
    pub presence: PresenceConfig,
    pub event: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

/// 同步协调器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 整项目保存的去抖间隔
    pub debounce_ms: u64,
    /// 编辑锁超时，期间缓冲远端推送
    pub editing_lock_timeout_ms: u64,
    /// 云端加载超时，超时后回退到本地检查点
    pub cloud_load_timeout_ms: u64,
    /// 自动检查点间隔
    pub autosave_interval_ms: u64,
    /// 消费者轮询间隔（等待重试到期）
    pub drain_poll_interval_ms: u64,
    /// 队列创建后多久没有消费者挂载视为停滞
    pub stall_timeout_ms: u64,
    /// 是否自动启动队列消费者
    pub auto_drain: bool,
}

/// 冲突检测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// 远端版本超过基线多少个版本才算冲突（0 表示任何前进都算）
    pub version_tolerance: i64,
    /// 版本未前进时，远端更新时间领先基线超过该阈值也算冲突
    pub time_threshold_ms: i64,
    /// 冲突历史保留条数
    pub history_max_count: usize,
    /// 冲突记录归档时间
    pub archive_after_ms: i64,
}

/// 动作重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 首次重试延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 抖动比例（0.0 ~ 1.0）
    pub jitter_factor: f64,
    /// 视为可重试的远端状态码
    pub retryable_statuses: Vec<u16>,
}

/// 熔断器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 初次打开时长
    pub open_duration_ms: u64,
    /// 打开时长上限
    pub max_open_duration_ms: u64,
    /// 半开试探失败后打开时长的增长因子
    pub growth_factor: f64,
    /// 打开时长抖动比例
    pub jitter_factor: f64,
    /// 半开状态允许的试探调用数
    pub half_open_max_trials: u32,
}

/// 重连与连通性探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 初始重连间隔
    pub base_delay_ms: u64,
    /// 最大重连间隔
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
    /// 在线时的探测间隔
    pub ping_interval_ms: u64,
    /// 单次探测超时
    pub ping_timeout_ms: u64,
}

/// 乐观快照配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// 快照最长保留时间
    pub max_age_ms: i64,
    /// 快照最大数量（超出按 LRU 淘汰）
    pub max_count: usize,
    /// 清理周期
    pub sweep_interval_ms: u64,
}

/// 撤销/重做配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoConfig {
    /// 撤销栈深度
    pub history_size: usize,
    /// 允许远端版本前进的最大次数，超过则拒绝撤销
    pub version_tolerance: i64,
}

/// 操作分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationTier {
    QuickRead,
    StandardWrite,
    HeavyAggregation,
    Upload,
    RealtimeConnect,
}

/// 按操作分级的远端调用超时
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub quick_read_ms: u64,
    pub standard_write_ms: u64,
    pub heavy_aggregation_ms: u64,
    pub upload_ms: u64,
    pub realtime_connect_ms: u64,
}

/// 设备在线心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub enabled: bool,
    /// 心跳发布间隔
    pub heartbeat_interval_ms: u64,
    /// 在此窗口内有心跳的设备视为活跃
    pub active_window_ms: i64,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件广播缓冲区大小
    pub buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 800,
            editing_lock_timeout_ms: 2_000,
            cloud_load_timeout_ms: 15_000,
            autosave_interval_ms: 30_000,
            drain_poll_interval_ms: 500,
            stall_timeout_ms: 10_000,
            auto_drain: true,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            version_tolerance: 0,
            time_threshold_ms: 5_000,
            history_max_count: 50,
            archive_after_ms: 30 * 24 * 3600 * 1000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
            max_open_duration_ms: 300_000,
            growth_factor: 2.0,
            jitter_factor: 0.1,
            half_open_max_trials: 1,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            ping_interval_ms: 15_000,
            ping_timeout_ms: 5_000,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 5 * 60 * 1000,
            max_count: 50,
            sweep_interval_ms: 60_000,
        }
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            history_size: 50,
            version_tolerance: 5,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            quick_read_ms: 5_000,
            standard_write_ms: 10_000,
            heavy_aggregation_ms: 30_000,
            upload_ms: 60_000,
            realtime_connect_ms: 15_000,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 30_000,
            active_window_ms: 90_000,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

impl Default for FlowSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./flowsync_data"),
            user_id: String::new(),
            device_id: uuid::Uuid::new_v4().to_string(),
            sync: SyncConfig::default(),
            conflict: ConflictConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            reconnect: ReconnectConfig::default(),
            snapshot: SnapshotConfig::default(),
            undo: UndoConfig::default(),
            timeouts: TimeoutConfig::default(),
            presence: PresenceConfig::default(),
            event: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn editing_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.editing_lock_timeout_ms)
    }

    pub fn cloud_load_timeout(&self) -> Duration {
        Duration::from_millis(self.cloud_load_timeout_ms)
    }
}

impl TimeoutConfig {
    /// 获取指定操作分级的超时时间
    pub fn for_tier(&self, tier: OperationTier) -> Duration {
        let ms = match tier {
            OperationTier::QuickRead => self.quick_read_ms,
            OperationTier::StandardWrite => self.standard_write_ms,
            OperationTier::HeavyAggregation => self.heavy_aggregation_ms,
            OperationTier::Upload => self.upload_ms,
            OperationTier::RealtimeConnect => self.realtime_connect_ms,
        };
        Duration::from_millis(ms)
    }
}

impl FlowSyncConfig {
    pub fn builder() -> FlowSyncConfigBuilder {
        FlowSyncConfigBuilder::new()
    }

    /// 校验配置，拒绝会导致引擎行为异常的取值
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(FlowSyncError::Config("user_id 不能为空".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(FlowSyncError::Config("device_id 不能为空".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(FlowSyncError::Config("retry.max_attempts 必须大于 0".to_string()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(FlowSyncError::Config("retry.backoff_factor 不能小于 1.0".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(FlowSyncError::Config(
                "retry.max_delay_ms 不能小于 initial_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor)
            || !(0.0..=1.0).contains(&self.breaker.jitter_factor)
        {
            return Err(FlowSyncError::Config("jitter_factor 必须在 0.0 ~ 1.0 之间".to_string()));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_max_trials == 0 {
            return Err(FlowSyncError::Config(
                "breaker.failure_threshold 与 half_open_max_trials 必须大于 0".to_string(),
            ));
        }
        if self.breaker.max_open_duration_ms < self.breaker.open_duration_ms {
            return Err(FlowSyncError::Config(
                "breaker.max_open_duration_ms 不能小于 open_duration_ms".to_string(),
            ));
        }
        if self.snapshot.max_count == 0 || self.undo.history_size == 0 {
            return Err(FlowSyncError::Config(
                "snapshot.max_count 与 undo.history_size 必须大于 0".to_string(),
            ));
        }
        if self.conflict.version_tolerance < 0 || self.undo.version_tolerance < 0 {
            return Err(FlowSyncError::Config("版本容忍度不能为负数".to_string()));
        }
        if self.event.buffer_size == 0 {
            return Err(FlowSyncError::Config("event.buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct FlowSyncConfigBuilder {
    config: FlowSyncConfig,
}

impl FlowSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FlowSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = user_id.into();
        self
    }

    pub fn device_id<S: Into<String>>(mut self, device_id: S) -> Self {
        self.config.device_id = device_id.into();
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn conflict(mut self, conflict: ConflictConfig) -> Self {
        self.config.conflict = conflict;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.config.snapshot = snapshot;
        self
    }

    pub fn undo(mut self, undo: UndoConfig) -> Self {
        self.config.undo = undo;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn presence(mut self, presence: PresenceConfig) -> Self {
        self.config.presence = presence;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event.buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.config.debug_mode = debug;
        self
    }

    pub fn build(self) -> Result<FlowSyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
