//! K线推送服务配置模块

use serde::{Deserialize, Serialize};
use crate::klagg::bucket::parse_interval;
use crate::klcommon::{AppError, Result};

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/kline_stream.toml";

    /// 币安现货组合流地址
    pub const DEFAULT_WEBSOCKET_URL: &str = "wss://stream.binance.com:9443/stream";

    /// 默认订阅的交易对
    pub const DEFAULT_SYMBOLS: &[&str] = &["btcusdt", "ethusdt", "pepeusdt"];

    /// 默认K线周期
    pub const DEFAULT_INTERVAL: &str = "1m";

    /// 每个订阅者通道的默认容量
    pub const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;

    /// 行情 -> 聚合器 通道容量
    pub const DEFAULT_TICK_CHANNEL_CAPACITY: usize = 10240;
}

use constants::*;

fn default_enable_console_output() -> bool {
    true
}

fn default_connection_lifetime_secs() -> u64 {
    24 * 60 * 60
}

/// K线推送服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 行情接入配置
    #[serde(default)]
    pub feed: FeedConfig,

    /// 聚合器配置
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,

    /// 推送服务配置
    #[serde(default)]
    pub server: ServerConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 行情接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// WebSocket 组合流地址（不含 ?streams= 部分）
    pub websocket_url: String,

    /// 订阅的交易对列表
    pub symbols: Vec<String>,

    /// 首次重连等待（秒），之后指数退避
    pub reconnect_interval_secs: u64,

    /// 重连等待上限（秒）
    pub max_reconnect_delay_secs: u64,

    /// 单个连接的最长存活时间（秒），到期后主动重连
    #[serde(default = "default_connection_lifetime_secs")]
    pub connection_lifetime_secs: u64,

    /// 行情 -> 聚合器 通道容量
    pub tick_channel_capacity: usize,
}

/// 聚合器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// K线周期，例如 "1m"
    pub interval: String,

    /// 每个订阅者的通道容量，满了就丢弃
    pub subscriber_channel_capacity: usize,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 连接超时（秒）
    pub connection_timeout_secs: u64,

    /// 是否启用WAL模式
    pub enable_wal: bool,
}

/// 推送服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录
    pub log_dir: String,

    /// 是否启用控制台输出
    #[serde(default = "default_enable_console_output")]
    pub enable_console_output: bool,

    /// 文件日志是否使用JSON格式
    #[serde(default)]
    pub json_format: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            reconnect_interval_secs: 1,
            max_reconnect_delay_secs: 30,
            connection_lifetime_secs: default_connection_lifetime_secs(),
            tick_channel_capacity: DEFAULT_TICK_CHANNEL_CAPACITY,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL.to_string(),
            subscriber_channel_capacity: DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "kline_stream.db".to_string(),
            pool_size: 4,
            connection_timeout_secs: 30,
            enable_wal: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:50051".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            enable_console_output: true,
            json_format: false,
        }
    }
}

impl ServiceConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::ConfigError(format!("序列化配置失败: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        parse_interval(&self.aggregator.interval)?;

        if self.feed.symbols.is_empty() {
            return Err(AppError::ConfigError("订阅的交易对列表不能为空".to_string()));
        }
        if self.feed.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(AppError::ConfigError("交易对不能为空字符串".to_string()));
        }

        url::Url::parse(&self.feed.websocket_url)?;

        if self.feed.reconnect_interval_secs == 0 {
            return Err(AppError::ConfigError("重连间隔必须大于0".to_string()));
        }
        if self.feed.max_reconnect_delay_secs < self.feed.reconnect_interval_secs {
            return Err(AppError::ConfigError(
                "重连等待上限不能小于首次重连间隔".to_string()
            ));
        }
        if self.feed.connection_lifetime_secs == 0 {
            return Err(AppError::ConfigError("连接存活时间必须大于0".to_string()));
        }
        if self.feed.tick_channel_capacity == 0 {
            return Err(AppError::ConfigError("行情通道容量必须大于0".to_string()));
        }

        if self.aggregator.subscriber_channel_capacity == 0 {
            return Err(AppError::ConfigError("订阅者通道容量必须大于0".to_string()));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        self.server.bind_addr.parse::<std::net::SocketAddr>()?;

        Ok(())
    }

    /// 用命令行参数覆盖周期和交易对，之后需要重新 `validate`
    pub fn apply_overrides(&mut self, interval: Option<&str>, symbols: Option<&[String]>) {
        if let Some(interval) = interval {
            self.aggregator.interval = interval.to_string();
        }
        if let Some(symbols) = symbols {
            self.feed.symbols = symbols.to_vec();
        }
    }

    /// 聚合周期（毫秒）
    pub fn interval_ms(&self) -> Result<i64> {
        parse_interval(&self.aggregator.interval)
    }
}
