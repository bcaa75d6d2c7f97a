//! 统一日志系统初始化模块
//!
//! 控制台与按日滚动的文件输出使用相同的过滤规则，过滤级别优先取 `RUST_LOG`

use crate::klcommon::{config::LoggingConfig, AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志系统守卫，drop 时刷新文件日志
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

fn build_filter(log_level: &str) -> EnvFilter {
    // 第三方网络库只保留警告
    let fallback = format!("{},tungstenite=warn,tokio_tungstenite=warn,reqwest=warn,hyper=warn", log_level);
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// 初始化日志系统，只能调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let console_layer = if config.console_output {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(build_filter(&config.log_level)),
        )
    } else {
        None
    };

    let (file_layer, file_guard) = if config.file_output {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, "aggr_kline.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = if config.json_format {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(build_filter(&config.log_level))
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(build_filter(&config.log_level))
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("Failed to initialize logging: {}", e)))?;

    Ok(LogGuard { _file_guard: file_guard })
}
