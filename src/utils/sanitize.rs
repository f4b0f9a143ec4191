//! Name sanitization for inbound files.

/// Reduce a (possibly adversarial) advertised file name to a single safe
/// path component.
///
/// - Normalizes `\` to `/` and keeps only the last component.
/// - Strips `.` and `..` components.
/// - Keeps only alphanumeric chars plus `.`, `-`, `_`, `(`, `)` and ` `.
/// - Trims leading dots so the result is never hidden or relative.
/// - Falls back to `"file"` when the result would otherwise be empty.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .next_back()
        .unwrap_or("");

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')'))
        .collect();
    let safe = safe.trim().trim_start_matches('.');

    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}
