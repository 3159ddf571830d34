//! API Routes
//!
//! Route handlers organized by functionality.

pub mod health;
pub mod ingest;
pub mod labels;
pub mod render;

use chrono::{DateTime, Utc};

use crate::api::error::{ApiError, ApiResult};

/// Parse a time parameter
///
/// Accepts unix seconds, RFC 3339, `now`, or `now-<n><unit>` where unit is
/// one of `s`, `m` (minutes), `h`, `d`, `w`.
pub(crate) fn parse_time(s: &str, now: DateTime<Utc>) -> ApiResult<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| ApiError::Validation(format!("Timestamp out of range: {}", s)));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    parse_relative_time(s, now)
}

/// Parse relative time like "now-15m"
fn parse_relative_time(s: &str, now: DateTime<Utc>) -> ApiResult<DateTime<Utc>> {
    if s == "now" {
        return Ok(now);
    }

    let re = regex::Regex::new(r"^now-(\d+)([smhdw])$")
        .map_err(|_| ApiError::Internal("Regex error".to_string()))?;

    if let Some(caps) = re.captures(s) {
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| ApiError::Validation("Invalid number in time expression".to_string()))?;

        let secs = match &caps[2] {
            "s" => Some(amount),
            "m" => amount.checked_mul(60),
            "h" => amount.checked_mul(3600),
            "d" => amount.checked_mul(24 * 3600),
            "w" => amount.checked_mul(7 * 24 * 3600),
            unit => {
                return Err(ApiError::Validation(format!(
                    "Invalid time unit: {}",
                    unit
                )))
            }
        };

        return secs
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or_else(|| ApiError::Validation(format!("Relative time out of range: {}", s)));
    }

    Err(ApiError::Validation(format!(
        "Cannot parse time: {}",
        s
    )))
}
