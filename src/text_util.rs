/// Maximum number of characters in a highlighted excerpt.
pub const EXCERPT_WINDOW_CHARS: usize = 500;

/// Wrap every case-insensitive occurrence of `query` in `<mark>` tags.
///
/// The original casing of each match is preserved. An empty query returns
/// the text unchanged.
pub fn highlight_matches(text: &str, query: &str) -> String {
    if query.is_empty() {
        return text.to_string();
    }

    let text_lower = text.to_lowercase();
    let query_lower = query.to_lowercase();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = text_lower[cursor..].find(&query_lower) {
        let start = cursor + offset;
        let end = start + query_lower.len();
        // Lowercasing can change byte lengths for some scripts; bail out
        // rather than split a char.
        if !text.is_char_boundary(start) || !text.is_char_boundary(end) {
            return text.to_string();
        }
        out.push_str(&text[cursor..start]);
        out.push_str("<mark>");
        out.push_str(&text[start..end]);
        out.push_str("</mark>");
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Extract a window of up to [`EXCERPT_WINDOW_CHARS`] characters centered
/// on the first occurrence of `query`, with matches highlighted.
///
/// Falls back to the head of the text when the query does not occur.
/// Truncated edges are marked with ellipses.
pub fn excerpt_around_match(text: &str, query: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= EXCERPT_WINDOW_CHARS {
        return highlight_matches(text, query);
    }

    let match_center = find_char_offset(text, query)
        .map(|pos| pos + query.chars().count() / 2)
        .unwrap_or(EXCERPT_WINDOW_CHARS / 2);

    let half = EXCERPT_WINDOW_CHARS / 2;
    let start = match_center.saturating_sub(half);
    let end = (start + EXCERPT_WINDOW_CHARS).min(chars.len());
    let start = end.saturating_sub(EXCERPT_WINDOW_CHARS);

    let mut window: String = chars[start..end].iter().collect();
    if start > 0 {
        window = format!("...{window}");
    }
    if end < chars.len() {
        window.push_str("...");
    }

    highlight_matches(&window, query)
}

/// Character offset of the first case-insensitive occurrence of `query`.
fn find_char_offset(text: &str, query: &str) -> Option<usize> {
    if query.is_empty() {
        return None;
    }
    let byte_pos = text.to_lowercase().find(&query.to_lowercase())?;
    // The lowercase byte offset is only a valid index into the original
    // text when lowercasing did not change lengths.
    if text.is_char_boundary(byte_pos) {
        Some(text[..byte_pos].chars().count())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlight_single_match() {
        assert_eq!(
            highlight_matches("the budget report", "budget"),
            "the <mark>budget</mark> report"
        );
    }

    #[test]
    fn highlight_preserves_case() {
        assert_eq!(
            highlight_matches("Budget and BUDGET", "budget"),
            "<mark>Budget</mark> and <mark>BUDGET</mark>"
        );
    }

    #[test]
    fn highlight_empty_query_is_identity() {
        assert_eq!(highlight_matches("hello", ""), "hello");
    }

    #[test]
    fn highlight_no_match_is_identity() {
        assert_eq!(highlight_matches("hello world", "zzz"), "hello world");
    }

    #[test]
    fn excerpt_short_text_passes_through() {
        let out = excerpt_around_match("short text with a match", "match");
        assert_eq!(out, "short text with a <mark>match</mark>");
    }

    #[test]
    fn excerpt_centers_on_match() {
        let mut text = "x".repeat(2000);
        text.insert_str(1000, " needle ");
        let out = excerpt_around_match(&text, "needle");

        assert!(out.contains("<mark>needle</mark>"));
        assert!(out.starts_with("..."));
        assert!(out.ends_with("..."));
        // Window plus ellipses and mark tags.
        assert!(out.len() < EXCERPT_WINDOW_CHARS + 50);
    }

    #[test]
    fn excerpt_no_match_returns_head() {
        let text = "y".repeat(2000);
        let out = excerpt_around_match(&text, "absent");
        assert!(out.starts_with('y'));
        assert!(out.ends_with("..."));
    }

    #[test]
    fn excerpt_match_near_start() {
        let mut text = "needle ".to_string();
        text.push_str(&"z".repeat(2000));
        let out = excerpt_around_match(&text, "needle");
        assert!(out.starts_with("<mark>needle</mark>"));
        assert!(out.ends_with("..."));
    }
}
