// 导出共享模块
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod websocket;

// 重新导出常用类型，方便使用
pub use config::ServiceConfig;
pub use db::{CandlestickSink, Database};
pub use error::{AppError, Result};
pub use logging_setup::init_logging;
pub use models::{Candlestick, Tick};
pub use websocket::AggTradeFeed;
