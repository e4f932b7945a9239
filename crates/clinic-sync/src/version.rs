//! SDK 版本信息

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 版本字符串，例如 `clinic-sync/0.1.0`
pub fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), SDK_VERSION)
}
