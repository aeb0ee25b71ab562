use thiserror::Error;
use std::net::AddrParseError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Address parse error: {0}")]
    AddrParseError(#[from] AddrParseError),

    #[error("Web server error: {0}")]
    WebServerError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::WebSocketError(e.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::ConfigError(format!("解析配置文件失败: {}", e))
    }
}

impl AppError {
    /// 获取错误类型的简洁摘要，作为结构化日志字段 `error.summary` 使用
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 行情接入
            AppError::WebSocketError(_) => "realtime_market_data_failed",
            AppError::UrlParseError(_) => "market_endpoint_invalid",
            AppError::JsonError(_) => "trade_message_parsing_failed",
            AppError::DataError(_) => "trade_data_validation_failed",

            // K线存储
            AppError::DatabaseError(_) => "kline_data_persistence_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",
            AppError::PoolError(_) => "kline_storage_pool_exhausted",

            // 对外推送
            AppError::WebServerError(_) => "kline_stream_server_failed",
            AppError::AddrParseError(_) => "stream_server_address_invalid",

            // 系统资源
            AppError::IoError(_) => "kline_file_operation_failed",

            AppError::ConfigError(_) => "kline_service_configuration_invalid",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 行情连接据此决定是退避重连还是直接放弃本轮连接。
    pub fn is_retryable(&self) -> bool {
        match self {
            // 网络相关错误通常可重试
            AppError::WebSocketError(_) |
            AppError::IoError(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },
            AppError::SqliteError(_) |
            AppError::PoolError(_) => true,

            // 解析错误、配置错误等不可重试
            AppError::JsonError(_) |
            AppError::DataError(_) |
            AppError::ConfigError(_) |
            AppError::UrlParseError(_) |
            AppError::AddrParseError(_) |
            AppError::WebServerError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let ws = AppError::WebSocketError("connection reset".to_string());
        assert!(ws.is_retryable());
        assert_eq!(ws.get_error_type_summary(), "realtime_market_data_failed");

        let cfg = AppError::ConfigError("interval must be positive".to_string());
        assert!(!cfg.is_retryable());

        let busy = AppError::DatabaseError("database is locked".to_string());
        assert!(busy.is_retryable());
        let schema = AppError::DatabaseError("no such table".to_string());
        assert!(!schema.is_retryable());
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let app: AppError = err.into();
        assert!(matches!(app, AppError::JsonError(_)));
    }
}
