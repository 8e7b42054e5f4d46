mod json;

pub use json::*;

use tracing_subscriber::EnvFilter;

/// 初始化日志系统,`RUST_LOG` 优先于 `default_filter`
///
/// 重复调用是安全的,已有全局 subscriber 时直接返回。
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
