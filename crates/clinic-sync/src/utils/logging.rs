use tracing_subscriber::EnvFilter;

/// 初始化 tracing 输出，遵循 `RUST_LOG`，默认 `info`
///
/// 宿主已安装全局 subscriber 时静默跳过。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
