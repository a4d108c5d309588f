// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Parse an HTTP `Retry-After` header value.
///
/// Accepts both forms from RFC 9110: delta-seconds (`"120"`) and an
/// HTTP-date (`"Wed, 21 Oct 2015 07:28:00 GMT"`).  A date in the past and
/// anything unparsable yield `None`; the caller falls back to its configured
/// default cooldown.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 1 "), Some(Duration::from_secs(1)));
    }

    #[test]
    fn parses_http_date_in_future() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let header = future.to_rfc2822();
        let parsed = parse_retry_after(&header).expect("future date must parse");
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(80));
    }

    #[test]
    fn past_date_yields_none() {
        let past = chrono::Utc::now() - chrono::Duration::seconds(90);
        assert_eq!(parse_retry_after(&past.to_rfc2822()), None);
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("-5"), None);
    }
}
