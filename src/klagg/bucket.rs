//! 周期对齐工具
//!
//! 所有时间戳均为毫秒。对齐一律向下取整（floor），负时间戳同样成立。
//! 结果超出 i64 范围时返回 None，不回绕。

use crate::klcommon::{AppError, Result};

/// 把时间戳向下对齐到周期边界
pub fn truncate_to_interval(timestamp_ms: i64, interval_ms: i64) -> Option<i64> {
    debug_assert!(interval_ms > 0, "interval must be positive");
    timestamp_ms.checked_sub(timestamp_ms.rem_euclid(interval_ms))
}

/// 周期内最后一毫秒
pub fn bucket_close_time(bucket_start_ms: i64, interval_ms: i64) -> Option<i64> {
    bucket_start_ms.checked_add(interval_ms - 1)
}

/// 解析周期字符串: "30s", "1m", "4h", "1d"，或纯数字（毫秒）
pub fn parse_interval(interval: &str) -> Result<i64> {
    let interval = interval.trim();
    let invalid = || AppError::ConfigError(format!("无效的时间周期: '{}'", interval));

    if interval.is_empty() {
        return Err(invalid());
    }

    if let Ok(ms) = interval.parse::<i64>() {
        return if ms > 0 { Ok(ms) } else { Err(invalid()) };
    }

    let unit_start = interval.char_indices().last().map(|(i, _)| i).unwrap_or(0);
    let (value, unit) = interval.split_at(unit_start);
    let value: i64 = value.parse().map_err(|_| invalid())?;
    if value <= 0 {
        return Err(invalid());
    }

    let unit_ms = match unit {
        "s" => 1000,
        "m" => 60 * 1000,        // 分钟
        "h" => 60 * 60 * 1000,   // 小时
        "d" => 24 * 60 * 60 * 1000, // 天
        _ => return Err(invalid()),
    };

    value.checked_mul(unit_ms).ok_or_else(invalid)
}
