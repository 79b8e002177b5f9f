//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化 tracing：`RUST_LOG` 优先，默认 `info`
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
