//! 可取消的延迟任务
//!
//! 去抖保存、编辑锁过期等“延迟执行一次”的场景共用 [`DeferredTask`]：
//! - `arm` 重新计时，之前未触发的任务被取消
//! - 每次 arm 最多触发一次
//! - 被 drop 时自动取消，避免泄漏的后台任务

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct DeferredTask {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: Mutex::new(None),
        }
    }

    /// 在 `delay` 之后执行 `fut`，替换掉尚未触发的旧任务
    ///
    /// 不要在 `fut` 内部对同一个 DeferredTask 调用 arm/cancel。
    pub fn arm<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                debug!("🔄 延迟任务重新计时: {}", self.name);
                previous.abort();
            }
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        }));
    }

    /// 取消尚未触发的任务，返回是否确实取消了一个任务
    pub fn cancel(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// 是否有一个已计时、尚未完成的任务
    pub fn is_armed(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            if !handle.is_finished() {
                handle.abort();
            }
        }
    }
}
