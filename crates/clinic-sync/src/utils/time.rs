//! 时间工具
//!
//! 所有时间字段使用 UTC 毫秒时间戳，统一通过 `Utc::now().timestamp_millis()` 生成。

use chrono::{DateTime, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳格式化为 RFC 3339（日志用），无效时间戳返回原始数字
pub fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00+00:00");
        assert!(now_millis() > 1_700_000_000_000);
    }
}
