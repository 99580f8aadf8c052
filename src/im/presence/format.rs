//! 相对时间展示
//!
//! 存储的始终是原始毫秒时间戳，这里只负责展示分桶。

use chrono::{DateTime, Utc};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// 日历日期，例如 `Oct 17`（UTC）
pub fn calendar_date(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%b %-d").to_string())
        .unwrap_or_default()
}

enum Bucket {
    JustNow,
    Minutes(i64),
    Hours(i64),
    Days(i64),
    Date(String),
}

fn bucket(at: i64, now: i64) -> Bucket {
    // 本地时钟可能略慢于服务器时钟
    let diff = (now - at).max(0);
    if diff < MINUTE {
        Bucket::JustNow
    } else if diff < HOUR {
        Bucket::Minutes(diff / MINUTE)
    } else if diff < DAY {
        Bucket::Hours(diff / HOUR)
    } else if diff < WEEK {
        Bucket::Days(diff / DAY)
    } else {
        Bucket::Date(calendar_date(at))
    }
}

/// 最后在线时间文案
pub fn format_last_seen(last_seen: Option<i64>, now: i64) -> String {
    let Some(at) = last_seen else {
        return "Last seen: unknown".to_string();
    };
    match bucket(at, now) {
        Bucket::JustNow => "Last seen just now".to_string(),
        Bucket::Minutes(m) => format!("Last seen {}m ago", m),
        Bucket::Hours(h) => format!("Last seen {}h ago", h),
        Bucket::Days(d) => format!("Last seen {}d ago", d),
        Bucket::Date(date) => format!("Last seen on {}", date),
    }
}

/// 会话列表中的消息时间
pub fn format_chat_time(at: i64, now: i64) -> String {
    match bucket(at, now) {
        Bucket::JustNow => "Now".to_string(),
        Bucket::Minutes(m) => format!("{}m", m),
        Bucket::Hours(h) => format!("{}h", h),
        Bucket::Days(d) => format!("{}d", d),
        Bucket::Date(date) => date,
    }
}
