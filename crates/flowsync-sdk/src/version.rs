//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Migration Version** → migrations 文件（文件即版本，由 refinery 管理）
//! - **Runtime Metadata** → 本模块

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// build time（由 vergen 在 build.rs 中生成，生成失败时为 "unknown"）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(v) => v,
    None => "unknown",
};

/// 当前 SDK 支持的最高数据库 migration 版本。
/// 由 build.rs 扫描 migrations/ 下 V{version}__*.sql 取最大值生成。
/// 启动时若 DB 版本 > 此值则拒绝打开，防止降级后 schema 不兼容。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 运行时版本信息，写入导出数据，便于排查
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub sdk_version: &'static str,
    pub build_time: &'static str,
    pub db_version: i64,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        sdk_version: SDK_VERSION,
        build_time: BUILD_TIME,
        db_version: SDK_DB_VERSION,
    }
}
