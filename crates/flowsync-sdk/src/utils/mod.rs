//! 通用工具：时间、可观察状态容器、可取消的延迟任务

pub mod deferred;
pub mod state;
pub mod time;

pub use deferred::DeferredTask;
pub use state::StateContainer;
