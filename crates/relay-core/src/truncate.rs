//! Display truncation for notification payloads.

/// Marker appended when text is cut.
pub const ELLIPSIS: &str = "...";

/// Keep the first `max_chars` characters of `text`, appending [`ELLIPSIS`]
/// when anything was dropped.
///
/// Counts characters, not bytes, so multi-byte sequences are never split.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_owned(),
        Some((byte_idx, _)) => format!("{}{ELLIPSIS}", &text[..byte_idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_returned_as_is() {
        assert_eq!(truncate_chars("hello", 1000), "hello");
    }

    #[test]
    fn exact_boundary_returned_as_is() {
        let s = "x".repeat(1000);
        assert_eq!(truncate_chars(&s, 1000), s);
    }

    #[test]
    fn one_over_boundary_gets_marker() {
        let s = "a".repeat(1001);
        let out = truncate_chars(&s, 1000);
        assert!(out.ends_with(ELLIPSIS));
        assert_eq!(out.chars().count(), 1000 + ELLIPSIS.len());
    }

    #[test]
    fn unicode_does_not_break_on_boundary() {
        let s = "€".repeat(1500);
        let out = truncate_chars(&s, 1000);
        assert!(out.starts_with('€'));
        assert!(out.ends_with(ELLIPSIS));
    }
}
