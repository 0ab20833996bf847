//! 可观察状态容器
//!
//! 同步引擎的共享状态（项目列表等）统一放在 [`StateContainer`] 中：
//! 读写通过闭包完成，写入后递增修订号并通知所有订阅者。

use parking_lot::RwLock;
use tokio::sync::watch;

pub struct StateContainer<T> {
    state: RwLock<T>,
    revision: watch::Sender<u64>,
}

impl<T: Clone> StateContainer<T> {
    pub fn new(initial: T) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(initial),
            revision,
        }
    }

    /// 返回当前状态的副本
    pub fn get(&self) -> T {
        self.state.read().clone()
    }

    /// 只读访问，不克隆整个状态
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.read())
    }

    /// 修改状态并通知订阅者
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut guard = self.state.write();
            f(&mut guard)
        };
        self.revision.send_modify(|rev| *rev += 1);
        result
    }

    /// 整体替换状态
    pub fn replace(&self, value: T) -> T {
        self.update(|state| std::mem::replace(state, value))
    }

    /// 当前修订号，每次 update 加一
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// 订阅状态变更，收到通知后调用 [`StateContainer::get`] 读取最新值
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

impl<T: Clone + Default> Default for StateContainer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
