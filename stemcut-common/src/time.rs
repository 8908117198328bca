//! Timestamp formatting

use chrono::{DateTime, Local, Utc};

/// Human-readable local timestamp, `%Y-%m-%d %H:%M:%S`
pub fn format_local(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Short clock time used to prefix log lines, `%H:%M:%S`
pub fn clock(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M:%S").to_string()
}

/// Hours between `from` and `to`, rounded to two decimals
pub fn age_hours(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let secs = (to - from).num_milliseconds() as f64 / 1000.0;
    (secs / 3600.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_age_hours_rounds_to_two_decimals() {
        let start = Utc::now();
        assert_eq!(age_hours(start, start + Duration::minutes(90)), 1.5);
        assert_eq!(age_hours(start, start + Duration::seconds(20)), 0.01);
        assert_eq!(age_hours(start, start), 0.0);
    }

    #[test]
    fn test_format_local_shape() {
        let formatted = format_local(Utc::now());
        assert_eq!(formatted.len(), 19);
        assert_eq!(&formatted[4..5], "-");
        assert_eq!(&formatted[13..14], ":");
    }
}
