//! 统一日志系统初始化模块
//!
//! 控制台 + 按天滚动的文件日志。级别取自配置，`RUST_LOG` 优先。

use crate::klcommon::{config::LoggingConfig, AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "kline_stream.log";

/// 构造过滤器字符串，压低第三方库的噪音
pub fn build_filter_directive(log_level: &str) -> String {
    format!(
        "{},hyper=warn,tungstenite=warn,tokio_tungstenite=warn,r2d2=warn,tower_http=info",
        log_level
    )
}

/// 初始化日志。返回的 guard 必须由 main 持有到进程结束，否则文件日志会丢失尾部。
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let filter_str = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| build_filter_directive(&config.log_level));

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    };

    // .with(None) 是无操作的
    let console_layer = config
        .enable_console_output
        .then(|| fmt::layer().with_target(true).boxed());

    Registry::default()
        .with(file_layer.with_filter(EnvFilter::new(&filter_str)))
        .with(console_layer.map(|layer| layer.with_filter(EnvFilter::new(&filter_str))))
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    Ok(guard)
}
