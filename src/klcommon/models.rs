use crate::klcommon::{AppError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 单笔成交事件 - 聚合器的输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// 交易对，例如 "BTCUSDT"
    pub symbol: String,
    /// 成交价格
    pub price: f64,
    /// 事件时间戳（毫秒）
    pub event_time_ms: i64,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: f64, event_time_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            event_time_ms,
        }
    }

    /// 事件时间；超出 chrono 可表示范围时为 None
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.event_time_ms).single()
    }

    /// 行情边界上的输入校验
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(AppError::DataError("成交事件缺少交易对".to_string()));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(AppError::DataError(format!(
                "{} 的成交价格无效: {}",
                self.symbol, self.price
            )));
        }
        if self.event_time().is_none() {
            return Err(AppError::DataError(format!(
                "{} 的事件时间超出范围: {}",
                self.symbol, self.event_time_ms
            )));
        }
        Ok(())
    }
}

/// K线 - 一个交易对在一个固定周期内的OHLC汇总
///
/// 周期未结束时由聚合器独占并原地更新；结束后以值拷贝的形式推送给订阅者，
/// 之后不再变化。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candlestick {
    pub symbol: String,
    /// 周期起始时间（毫秒），即成交时间向下对齐到周期边界
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candlestick {
    /// 以周期内第一笔成交开一根新K线
    pub fn open_with(symbol: &str, open_time: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// 同一周期内的后续成交。open 在开线后不再改变。
    pub fn apply_price(&mut self, price: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
    }

    /// 周期起始时间；open_time 超出 chrono 可表示范围时为 None
    pub fn bucket_start(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.open_time).single()
    }

    /// high >= max(open, close) 且 low <= min(open, close)
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.low <= self.high
    }
}

/// 币安组合流（/stream）的外层包装: {"stream": "...", "data": {...}}
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// 币安原始归集交易事件
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceRawAggTrade {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub agg_id: i64,
    #[serde(rename = "p")]
    pub price: String,       // 成交价格 (字符串形式)
    #[serde(rename = "q")]
    pub quantity: String,    // 成交量 (字符串形式)
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
    #[serde(rename = "M", default)]
    pub ignore: bool,
}

impl BinanceRawAggTrade {
    /// 转换为内部的成交事件。K线按事件时间 `E` 分桶。
    pub fn to_tick(&self) -> Result<Tick> {
        let price = self.price.parse::<f64>().map_err(|e| {
            AppError::DataError(format!("无法解析价格 '{}': {}", self.price, e))
        })?;
        let tick = Tick::new(self.symbol.to_uppercase(), price, self.event_time);
        tick.validate()?;
        Ok(tick)
    }
}
