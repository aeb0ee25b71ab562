//! K线聚合模块
//!
//! - `bucket`: 时间周期对齐
//! - `aggregator`: 成交归约成K线，完成K线扇出给订阅者
//! - `ingestor`: 行情通道 -> 聚合器 -> 持久化 的单消费者循环

pub mod aggregator;
pub mod bucket;
pub mod ingestor;


pub use aggregator::{Aggregator, Subscription, SubscriptionId, DEFAULT_CHANNEL_CAPACITY};
pub use bucket::{parse_interval, truncate_to_interval};
pub use ingestor::{run_ingestion, IngestStats};
