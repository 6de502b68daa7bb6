//! Small shared helpers.

use chrono::Utc;

/// Truncate `text` to at most `max_chars` characters, breaking on a word
/// boundary where possible and appending an ellipsis when anything was cut.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }

    let hard_cut: String = trimmed.chars().take(max_chars).collect();
    let cut = match hard_cut.rfind(char::is_whitespace) {
        // Only back up to the word boundary if it keeps a useful amount of text.
        Some(idx) if idx >= max_chars / 2 => hard_cut[..idx].trim_end().to_string(),
        _ => hard_cut,
    };

    format!("{cut}…")
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
