//! Small helpers shared across the crate.

/// Cap on error-body text carried into error messages.
const ERROR_TEXT_LIMIT: usize = 180;

/// Trim optional text, mapping whitespace-only values to `None`.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    match value.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(trimmed) => Some(trimmed.to_string()),
    }
}

/// True for `http://` and `https://` values only.
pub fn is_http_url(value: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
}

/// Trim and cap free-form text so a response body fits in an error message.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(ERROR_TEXT_LIMIT).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collapse internal whitespace runs to single spaces and trim the ends.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_text_option_drops_blank_values() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some(String::new())), None);
        assert_eq!(normalize_text_option(Some(" \t ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_both_schemes_only() {
        assert!(is_http_url("http://localhost:54321"));
        assert!(is_http_url("https://demo.supabase.co"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("demo.supabase.co"));
    }

    #[test]
    fn compact_text_caps_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(compact_text(&long).len(), ERROR_TEXT_LIMIT);
        assert_eq!(compact_text("  short  "), "short");
    }

    #[test]
    fn collapse_whitespace_flattens_runs() {
        assert_eq!(collapse_whitespace("  Push   ups \t now "), "Push ups now");
        assert_eq!(collapse_whitespace("single"), "single");
        assert_eq!(collapse_whitespace("   "), "");
    }
}
