//! 熔断器 - 进程内唯一，所有远端调用共享
//!
//! 状态机：
//! - Closed：正常放行，连续失败达到阈值后打开
//! - Open：本地直接拒绝，不发起网络调用；打开时长到期后进入半开
//! - HalfOpen：只放行有限次数的试探调用，一次成功即关闭，一次失败重新打开
//!
//! 重新打开时打开时长按增长因子变长（带抖动，有上限），关闭后恢复初始时长。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{FlowSyncError, Result};
use crate::utils::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// 状态迁移记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub old_state: BreakerState,
    pub new_state: BreakerState,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_count: u64,
    pub short_circuited: u64,
    /// 距离允许试探还需等待的毫秒数（非 Open 时为 0）
    pub retry_after_ms: u64,
    pub current_open_duration_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    current_open_duration: Duration,
    half_open_trials: u32,
    open_count: u64,
    short_circuited: u64,
}

/// 熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                open_until: None,
                current_open_duration: Duration::from_millis(config.open_duration_ms),
                half_open_trials: 0,
                open_count: 0,
                short_circuited: 0,
            }),
            config,
            transitions,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// 订阅状态迁移
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: BreakerState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;
        match new_state {
            BreakerState::Open => {
                warn!(
                    "⚠️ 熔断器打开: {} 次连续失败，{}ms 内不再发起远端调用",
                    inner.consecutive_failures,
                    inner.current_open_duration.as_millis()
                );
            }
            BreakerState::HalfOpen => info!("🔄 熔断器半开，允许试探调用"),
            BreakerState::Closed => info!("✅ 熔断器关闭，远端恢复"),
        }
        let _ = self.transitions.send(BreakerTransition {
            old_state,
            new_state,
            timestamp: now_millis(),
        });
    }

    fn open(&self, inner: &mut BreakerInner) {
        let jitter = 1.0 + self.config.jitter_factor * (rand::random::<f64>() - 0.5);
        let duration = inner.current_open_duration.mul_f64(jitter.max(0.0));
        inner.open_until = Some(Instant::now() + duration);
        inner.half_open_trials = 0;
        inner.open_count += 1;
        self.transition(inner, BreakerState::Open);
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.half_open_trials = 0;
        inner.current_open_duration = Duration::from_millis(self.config.open_duration_ms);
        self.transition(inner, BreakerState::Closed);
    }

    fn retry_after(inner: &BreakerInner) -> u64 {
        inner
            .open_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0)
    }

    /// 发起远端调用前申请许可
    ///
    /// Open 且未到期时返回 `BreakerOpen`，调用方不得发起网络请求。
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.open_until.map(|u| Instant::now() >= u).unwrap_or(true);
                if elapsed {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_trials = 1;
                    Ok(())
                } else {
                    inner.short_circuited += 1;
                    Err(FlowSyncError::BreakerOpen {
                        retry_after_ms: Self::retry_after(&inner),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_trials < self.config.half_open_max_trials.max(1) {
                    inner.half_open_trials += 1;
                    Ok(())
                } else {
                    inner.short_circuited += 1;
                    Err(FlowSyncError::BreakerOpen { retry_after_ms: 0 })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => self.close(&mut inner),
            _ => inner.consecutive_failures = 0,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                let grown = inner.current_open_duration.mul_f64(self.config.growth_factor.max(1.0));
                inner.current_open_duration = grown.min(Duration::from_millis(self.config.max_open_duration_ms));
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    /// 连通性探测成功：打开时长已到期（或处于半开）时直接关闭
    pub fn on_ping_success(&self) {
        let mut inner = self.inner.lock();
        let expired = inner.open_until.map(|u| Instant::now() >= u).unwrap_or(true);
        match inner.state {
            BreakerState::Open if expired => {
                self.transition(&mut inner, BreakerState::HalfOpen);
                self.close(&mut inner);
            }
            BreakerState::HalfOpen => self.close(&mut inner),
            _ => {}
        }
    }

    /// 连通性探测失败只影响半开状态，不计入连续失败
    pub fn on_ping_failure(&self) {
        let is_half_open = self.inner.lock().state == BreakerState::HalfOpen;
        if is_half_open {
            self.record_failure();
        }
    }

    /// 手动重置（强制重连）
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_count: inner.open_count,
            short_circuited: inner.short_circuited,
            retry_after_ms: if inner.state == BreakerState::Open {
                Self::retry_after(&inner)
            } else {
                0
            },
            current_open_duration_ms: inner.current_open_duration.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            open_duration_ms: 1_000,
            max_open_duration_ms: 3_000,
            growth_factor: 2.0,
            jitter_factor: 0.0,
            half_open_max_trials: 1,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, FlowSyncError::BreakerOpen { retry_after_ms } if retry_after_ms <= 1_000));
        assert_eq!(breaker.stats().short_circuited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_counter() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
        breaker.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_growth() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        for expected in [2_000u64, 3_000, 3_000] {
            tokio::time::advance(Duration::from_millis(3_001)).await;
            breaker.try_acquire().unwrap();
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Open);
            assert_eq!(breaker.stats().current_open_duration_ms, expected);
        }

        tokio::time::advance(Duration::from_millis(3_001)).await;
        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.stats().current_open_duration_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_success_closes_only_after_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.on_ping_success();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        breaker.on_ping_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_broadcast() {
        let breaker = breaker();
        let mut rx = breaker.subscribe();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        breaker.try_acquire().unwrap();
        breaker.record_success();

        let states: Vec<BreakerState> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| t.new_state)
            .collect();
        assert_eq!(
            states,
            vec![BreakerState::Open, BreakerState::HalfOpen, BreakerState::Closed]
        );
    }
}
