//! Text helpers shared by the dispatcher, the deploy transcript and the
//! channels.
//!
//! All limits are counted in characters, never bytes, so multi-byte output
//! (CJK filenames, emoji in commit messages) is never cut mid-codepoint.

/// Marker line inserted between the kept head and tail of oversized output.
pub const TRUNCATION_MARKER: &str = "... output truncated ...";

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Only used for log previews of inbound messages; command output goes
/// through [`truncate_output`], which keeps the tail.
///
/// # Examples
/// ```ignore
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Byte offset of the `n`th character, or `s.len()` past the end.
fn char_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(idx, _)| idx)
}

/// Bound captured command output for a reply.
///
/// The input is trimmed first. Output within `max_chars` is returned as is;
/// longer output keeps the first and last `max_chars / 2` characters around
/// a [`TRUNCATION_MARKER`] line, so both the invoked command and its final
/// status survive. A `max_chars` below 2 leaves only the marker; config
/// validation rejects such limits.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let value = text.trim();
    let total = value.chars().count();
    if total <= max_chars {
        return value.to_string();
    }

    let half = max_chars / 2;
    let head = &value[..char_offset(value, half)];
    let tail = &value[char_offset(value, total - half)..];
    format!("{head}\n{TRUNCATION_MARKER}\n{tail}")
}

/// Split a reply into consecutive chunks of at most `max_chars` characters.
///
/// Concatenating the chunks yields the input exactly. Empty input yields a
/// single empty chunk so callers always have something to send. A zero
/// limit is treated as one.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }

    let limit = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == limit {
            chunks.push(text[start..idx].to_string());
            start = idx;
            count = 0;
        }
        count += 1;
    }
    chunks.push(text[start..].to_string());

    chunks
}
