//! String helpers for building shell command text.

/// Normalize an indented multiline literal: trim surrounding whitespace and
/// the indentation of every line. Used for embedded `targetcli`/`iscsiadm`
/// scripts so they can be written readably in source.
pub fn multiline(text: &str) -> String {
    text.trim()
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Single-quote a string for the shell, escaping embedded single quotes.
pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
