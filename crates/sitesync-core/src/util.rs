//! Small helpers shared by config, transport and the sync loop.

use std::time::Duration;

/// Trimmed text, or `None` when missing or blank.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse an optional http(s) base URL, dropping trailing slashes.
///
/// Blank input is treated as unset. Anything else must carry an
/// `http://` or `https://` scheme.
pub fn parse_base_url(value: Option<String>) -> Result<Option<String>, String> {
    let Some(url) = non_blank(value) else {
        return Ok(None);
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(format!("'{url}' must start with http:// or https://"));
    }
    Ok(Some(url.trim_end_matches('/').to_string()))
}

/// Response bodies quoted in errors are capped at this many characters.
pub const MAX_ERROR_BODY_CHARS: usize = 180;

/// Collapse a response body into a single short line for error messages.
pub fn compact_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Time left until `deadline_ms`, zero when it already passed.
pub fn until_millis(deadline_ms: i64) -> Duration {
    let remaining = deadline_ms.saturating_sub(now_millis());
    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_is_none() {
        assert_eq!(non_blank(None), None);
        assert_eq!(non_blank(Some(" \t ".to_string())), None);
        assert_eq!(non_blank(Some(" token ".to_string())), Some("token".to_string()));
    }

    #[test]
    fn base_url_requires_http_scheme() {
        assert_eq!(parse_base_url(None), Ok(None));
        assert_eq!(parse_base_url(Some("   ".to_string())), Ok(None));
        assert_eq!(
            parse_base_url(Some(" https://sync.example.com// ".to_string())),
            Ok(Some("https://sync.example.com".to_string()))
        );
        assert!(parse_base_url(Some("ftp://sync.example.com".to_string())).is_err());
        assert!(parse_base_url(Some("sync.example.com".to_string())).is_err());
    }

    #[test]
    fn compact_text_collapses_and_truncates() {
        assert_eq!(compact_text("  bad\n  request \t body "), "bad request body");
        let long = "x".repeat(500);
        assert_eq!(compact_text(&long).len(), MAX_ERROR_BODY_CHARS);
    }

    #[test]
    fn past_deadlines_are_due_now() {
        assert_eq!(until_millis(now_millis() - 5_000), Duration::ZERO);
        assert!(until_millis(now_millis() + 60_000) > Duration::from_secs(30));
    }
}
