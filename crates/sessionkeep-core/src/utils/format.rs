use chrono::{Duration, TimeZone, Utc};

/// Characters of a token shown on each side when masked
const MASK_VISIBLE_CHARS: usize = 4;

/// Format time remaining until expiry for display
pub fn format_remaining(remaining: Duration) -> String {
    let minutes = remaining.num_minutes();
    if remaining <= Duration::zero() {
        "expired".to_string()
    } else if minutes < 1 {
        "under a minute".to_string()
    } else if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, remaining_mins)
        }
    } else {
        let days = minutes / 1440;
        let remaining_hours = (minutes % 1440) / 60;
        if remaining_hours >= 12 {
            // Round up: 1d 12h+ becomes 2d
            format!("{}d", days + 1)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format a millisecond timestamp as a UTC date-time
pub fn format_timestamp(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => millis.to_string(),
    }
}

/// Mask a credential for display, keeping a few characters at each end
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= MASK_VISIBLE_CHARS * 2 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..MASK_VISIBLE_CHARS].iter().collect();
    let tail: String = chars[chars.len() - MASK_VISIBLE_CHARS..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::seconds(-5)), "expired");
        assert_eq!(format_remaining(Duration::zero()), "expired");
        assert_eq!(format_remaining(Duration::seconds(30)), "under a minute");
        assert_eq!(format_remaining(Duration::minutes(42)), "42m");
        assert_eq!(format_remaining(Duration::minutes(60)), "1h");
        assert_eq!(format_remaining(Duration::minutes(125)), "2h 5m");
        assert_eq!(format_remaining(Duration::hours(30)), "1d");
        assert_eq!(format_remaining(Duration::hours(36)), "2d");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(1_700_000_000_000), "2023-11-14 22:13:20 UTC");
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abcdefghijkl"), "abcd...ijkl");
        assert_eq!(mask_token("short"), "*****");
        assert_eq!(mask_token(""), "");
    }
}
