//! 日志初始化
//!
//! 库内部只使用 `tracing` 宏输出日志；宿主应用可以自行安装 subscriber，
//! 也可以调用 [`init_logging`] 安装一个默认的 fmt subscriber。

use tracing::Level;

/// 安装全局 fmt subscriber，返回是否由本次调用安装
///
/// 已有全局 subscriber 时不做任何事并返回 false。
pub fn init_logging(level: Level) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("日志系统已初始化, level={}", level);
    }
    installed
}

/// 按配置中的调试开关选择日志级别
pub fn init_logging_for(debug_mode: bool) -> bool {
    init_logging(if debug_mode { Level::DEBUG } else { Level::INFO })
}
