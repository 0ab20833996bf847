//! 失败分类与重试策略
//!
//! 按失败原因决定重试还是进入死信，重试间隔指数退避并带抖动。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::FlowSyncError;

/// 动作失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 请求超时 - 可重试
    Timeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 远端返回状态码 - 根据可重试状态码集合决定
    Status(u16),
    /// 远端未给出状态码的错误 - 保守视为可重试
    Remote(String),
    /// 本地或远端校验失败 - 不重试
    Validation(String),
    /// 其他不可恢复错误
    Fatal(String),
}

impl FailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            FailureReason::Timeout => true,
            FailureReason::NetworkUnavailable => true,
            FailureReason::Status(code) => retryable_statuses.contains(code),
            FailureReason::Remote(_) => true,
            FailureReason::Validation(_) => false,
            FailureReason::Fatal(_) => false,
        }
    }

    /// 重试延迟倍数，限流时等待更久
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            FailureReason::Status(429) => 2.0,
            FailureReason::NetworkUnavailable => 1.5,
            _ => 1.0,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FailureReason::Timeout => "timeout".to_string(),
            FailureReason::NetworkUnavailable => "network unavailable".to_string(),
            FailureReason::Status(code) => format!("status {}", code),
            FailureReason::Remote(msg) => format!("remote: {}", msg),
            FailureReason::Validation(msg) => format!("validation: {}", msg),
            FailureReason::Fatal(msg) => format!("fatal: {}", msg),
        }
    }
}

impl From<&FlowSyncError> for FailureReason {
    fn from(error: &FlowSyncError) -> Self {
        match error {
            FlowSyncError::Timeout(_) => FailureReason::Timeout,
            FlowSyncError::Network(_) | FlowSyncError::BreakerOpen { .. } => {
                FailureReason::NetworkUnavailable
            }
            FlowSyncError::Remote { status: Some(code), .. } => FailureReason::Status(*code),
            FlowSyncError::Remote { status: None, message } => FailureReason::Remote(message.clone()),
            FlowSyncError::Validation(msg) => FailureReason::Validation(msg.clone()),
            FlowSyncError::NotFound(msg) | FlowSyncError::InvalidOperation(msg) => {
                FailureReason::Validation(msg.clone())
            }
            other => FailureReason::Fatal(other.to_string()),
        }
    }
}

/// 失败后的处理决定
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 在 delay 之后重试
    Retry { delay: Duration },
    /// 放弃，进入死信
    DeadLetter { reason: String },
}

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
            retryable_statuses: config.retryable_statuses.clone(),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间
    ///
    /// delay = initial * factor^(attempt-1)，封顶 max_delay，再加抖动
    pub fn delay_for_attempt(&self, attempt: u32, reason: &FailureReason) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powf(exponent);
        let capped = (base * reason.delay_multiplier()).min(self.max_delay_ms as f64);
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped + jitter).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(final_delay as u64)
    }

    /// 根据已尝试次数和失败原因决定重试还是进入死信
    pub fn decide(&self, attempts: u32, reason: &FailureReason) -> RetryDecision {
        if !reason.is_retryable(&self.retryable_statuses) {
            return RetryDecision::DeadLetter {
                reason: format!("不可重试的失败: {}", reason.describe()),
            };
        }
        if attempts >= self.max_attempts {
            return RetryDecision::DeadLetter {
                reason: format!("重试次数已用尽 ({}): {}", attempts, reason.describe()),
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for_attempt(attempts, reason),
        }
    }
}
