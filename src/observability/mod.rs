//! 可观测性：tracing 订阅器初始化
//!
//! 日志一律写到 stderr：stdout 留给 JSON 行协议。`RUST_LOG` 优先于配置中的级别。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSection;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// 按 [logging] 段初始化；format = "json" 时输出结构化日志（重复初始化返回错误）
pub fn init(logging: &LoggingSection) -> Result<(), tracing_subscriber::util::TryInitError> {
    let registry = tracing_subscriber::registry().with(filter(&logging.level));
    if logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    }
}
