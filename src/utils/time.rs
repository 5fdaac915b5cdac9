//! 时间处理工具

use chrono::{DateTime, Duration, TimeZone, Utc};

/// 获取 N 天前的时间
pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

/// 获取 N 小时前的时间
pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳转 UTC 时间，非法值回退到 Unix 纪元
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

/// 格式化为 ISO 8601
pub fn format_iso8601(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// 解析 ISO 8601 时间字符串
pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip() {
        let ms = 1_700_000_000_000;
        let dt = from_millis(ms);
        assert_eq!(dt.timestamp_millis(), ms);
    }

    #[test]
    fn test_format_parse_iso8601() {
        let now = Utc::now();
        let formatted = format_iso8601(&now);
        let parsed = parse_iso8601(&formatted).unwrap();

        // 毫秒截断，允许 1 秒误差
        assert!((now - parsed).num_seconds().abs() <= 1);
    }

    #[test]
    fn test_days_ago() {
        let week_ago = days_ago(7);
        let now = Utc::now();
        assert!(week_ago < now);
        let diff_days = (now - week_ago).num_days();
        assert!((6..=7).contains(&diff_days));
    }
}
