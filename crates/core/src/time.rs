//! Epoch-second helpers. Every "expiry" is stored as epoch seconds and
//! rendered in the declared account timezone (UTC+8) only at display time,
//! per the timezone design note: storage and rendering must not both try to
//! be authoritative or off-by-hours bugs creep in.

use chrono::{FixedOffset, TimeZone};

/// Source timezone offset for human-readable expiry rendering.
const ACCOUNT_TZ_OFFSET_SECS: i32 = 8 * 3600;

pub fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Render an epoch second as `YYYY-MM-DD HH:MM:SS` in the account timezone.
pub fn format_account_tz(epoch_secs: i64) -> String {
    let offset = FixedOffset::east_opt(ACCOUNT_TZ_OFFSET_SECS).expect("valid fixed offset");
    match offset.timestamp_opt(epoch_secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => String::new(),
    }
}

/// Parse a `YYYY-MM-DD HH:MM:SS` string in the account timezone into epoch seconds.
pub fn parse_account_tz(value: &str) -> Option<i64> {
    let offset = FixedOffset::east_opt(ACCOUNT_TZ_OFFSET_SECS)?;
    let naive = chrono::NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    match offset.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt.timestamp()),
        chrono::LocalResult::Ambiguous(dt, _) => Some(dt.timestamp()),
        chrono::LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_tz_round_trips() {
        let original = 1_700_000_000_i64;
        let rendered = format_account_tz(original);
        let parsed = parse_account_tz(&rendered).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_account_tz_rejects_malformed() {
        assert_eq!(parse_account_tz("not-a-date"), None);
    }
}
