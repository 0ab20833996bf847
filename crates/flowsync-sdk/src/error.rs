//! 错误类型定义
//!
//! 所有公开操作返回 [`Result<T>`]，错误统一为 [`FlowSyncError`]。
//! 每个错误都可以归入一个 [`ErrorClass`]，队列与协调器据此决定
//! 重试、进入死信、转交冲突流程还是直接上报。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowSyncError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// 远端返回的业务错误，status 为 HTTP 语义状态码（未知时为 None）
    #[error("Remote error [{status:?}]: {message}")]
    Remote { status: Option<u16>, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Project {project_id} has an unresolved conflict")]
    ConflictPending { project_id: String },

    #[error("Action {action_id} moved to dead letter: {reason}")]
    DeadLetter { action_id: String, reason: String },

    /// 撤销/重做期间远端版本前进超过容忍度
    #[error("Stale undo: remote advanced {advanced} versions (tolerance {tolerance})")]
    StaleUndo { advanced: i64, tolerance: i64 },

    #[error("Circuit breaker open, retry after {retry_after_ms}ms")]
    BreakerOpen { retry_after_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 错误分类
///
/// - Transient：超时、网络、5xx/429 等，可以重试
/// - Validation：远端拒绝或本地校验失败，重试无意义
/// - Conflict：需要用户选择解决策略
/// - DeadLetter：动作已放弃
/// - Fatal：存储损坏、未初始化等无法在同步层恢复的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Validation,
    Conflict,
    DeadLetter,
    Fatal,
}

/// 默认视为可重试的远端状态码
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

impl FlowSyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowSyncError::Timeout(_)
            | FlowSyncError::Network(_)
            | FlowSyncError::BreakerOpen { .. } => ErrorClass::Transient,
            FlowSyncError::Remote { status, .. } => match status {
                None => ErrorClass::Transient,
                Some(code) if DEFAULT_RETRYABLE_STATUSES.contains(code) => ErrorClass::Transient,
                Some(code) if *code >= 500 => ErrorClass::Transient,
                Some(_) => ErrorClass::Validation,
            },
            FlowSyncError::Validation(_)
            | FlowSyncError::NotFound(_)
            | FlowSyncError::InvalidOperation(_)
            | FlowSyncError::Serialization(_)
            | FlowSyncError::StaleUndo { .. }
            | FlowSyncError::Config(_) => ErrorClass::Validation,
            FlowSyncError::ConflictPending { .. } => ErrorClass::Conflict,
            FlowSyncError::DeadLetter { .. } => ErrorClass::DeadLetter,
            FlowSyncError::Storage(_)
            | FlowSyncError::Database(_)
            | FlowSyncError::KvStore(_)
            | FlowSyncError::Migration(_)
            | FlowSyncError::IO(_)
            | FlowSyncError::NotInitialized(_)
            | FlowSyncError::ShuttingDown(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// 是否应计入熔断器的失败次数
    ///
    /// 只有“远端不可达/不健康”类错误计入；校验失败说明远端正常响应。
    pub fn counts_against_breaker(&self) -> bool {
        match self {
            FlowSyncError::Timeout(_) | FlowSyncError::Network(_) => true,
            FlowSyncError::Remote { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
            },
            _ => false,
        }
    }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        FlowSyncError::Remote { status: Some(status), message: message.into() }
    }
}

impl From<rusqlite::Error> for FlowSyncError {
    fn from(error: rusqlite::Error) -> Self {
        FlowSyncError::Database(error.to_string())
    }
}

impl From<serde_json::Error> for FlowSyncError {
    fn from(error: serde_json::Error) -> Self {
        FlowSyncError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for FlowSyncError {
    fn from(error: bincode::Error) -> Self {
        FlowSyncError::Serialization(error.to_string())
    }
}

impl From<sled::Error> for FlowSyncError {
    fn from(error: sled::Error) -> Self {
        FlowSyncError::KvStore(error.to_string())
    }
}

impl From<std::io::Error> for FlowSyncError {
    fn from(error: std::io::Error) -> Self {
        FlowSyncError::IO(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowSyncError>;

/// 公开操作的三态结果
///
/// 调用方不需要自己解析错误：可重试的失败与终态失败被显式区分。
#[derive(Debug)]
pub enum SyncOutcome<T> {
    Success(T),
    Retryable(FlowSyncError),
    Terminal(FlowSyncError),
}

impl<T> SyncOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncOutcome::Retryable(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            SyncOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FlowSyncError> {
        match self {
            SyncOutcome::Success(_) => None,
            SyncOutcome::Retryable(e) | SyncOutcome::Terminal(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            SyncOutcome::Success(v) => Ok(v),
            SyncOutcome::Retryable(e) | SyncOutcome::Terminal(e) => Err(e),
        }
    }
}

impl<T> From<Result<T>> for SyncOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => SyncOutcome::Success(v),
            Err(e) if e.is_retryable() => SyncOutcome::Retryable(e),
            Err(e) => SyncOutcome::Terminal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(FlowSyncError::Timeout("save".into()).class(), ErrorClass::Transient);
        assert_eq!(FlowSyncError::remote(503, "unavailable").class(), ErrorClass::Transient);
        assert_eq!(FlowSyncError::remote(429, "slow down").class(), ErrorClass::Transient);
        assert_eq!(FlowSyncError::remote(422, "bad task").class(), ErrorClass::Validation);
        assert_eq!(
            FlowSyncError::ConflictPending { project_id: "p1".into() }.class(),
            ErrorClass::Conflict
        );
        assert_eq!(FlowSyncError::Database("disk".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(FlowSyncError::Network("reset".into()).counts_against_breaker());
        assert!(FlowSyncError::remote(500, "boom").counts_against_breaker());
        assert!(!FlowSyncError::remote(400, "bad").counts_against_breaker());
        assert!(!FlowSyncError::Validation("empty id".into()).counts_against_breaker());
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: SyncOutcome<u32> = Ok(7).into();
        assert!(ok.is_success());

        let retry: SyncOutcome<u32> = Err(FlowSyncError::Timeout("load".into())).into();
        assert!(retry.is_retryable());

        let terminal: SyncOutcome<u32> = Err(FlowSyncError::Validation("x".into())).into();
        assert!(matches!(terminal, SyncOutcome::Terminal(FlowSyncError::Validation(_))));
    }
}
