//! 时间处理工具模块
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **业务层**: 统一使用 [`now_millis`] 生成时间
//! - **计时器**: 退避、熔断、去抖使用 `tokio::time`，不依赖墙钟

use chrono::{TimeZone, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 距离 `timestamp_ms` 已经过去的毫秒数（时间戳在未来时返回 0）
pub fn elapsed_since(timestamp_ms: i64) -> i64 {
    (now_millis() - timestamp_ms).max(0)
}

/// 格式化为 RFC3339，用于导出数据和日志
pub fn format_rfc3339(timestamp_ms: i64) -> String {
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => timestamp_ms.to_string(),
    }
}
