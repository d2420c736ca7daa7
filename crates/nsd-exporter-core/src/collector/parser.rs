//! Parser for `key=value` stats lines.
//!
//! Pure functions over string slices, so they can be tested with literals.

use thiserror::Error;

/// Separator between key and value. Only the first occurrence splits.
pub const SEPARATOR: char = '=';

/// Problem with a single response line. The line is skipped, the scrape goes on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("no '=' in line '{0}'")]
    MissingSeparator(String),
    #[error("empty key in line '{0}'")]
    EmptyKey(String),
    #[error("value '{value}' of '{key}' is not a number")]
    InvalidValue { key: String, value: String },
}

/// One split stats line. `key` is trimmed, `value` is left as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatLine<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

/// Splits a line at the first separator.
///
/// Returns `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<StatLine<'_>>, LineError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let (key, value) = line
        .split_once(SEPARATOR)
        .ok_or_else(|| LineError::MissingSeparator(line.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(LineError::EmptyKey(line.to_string()));
    }
    Ok(Some(StatLine { key, value }))
}

/// Parses the value part of a line as a float. Surrounding whitespace,
/// including a trailing `\r`, is ignored.
pub fn parse_value(line: &StatLine<'_>) -> Result<f64, LineError> {
    line.value
        .trim()
        .parse()
        .map_err(|_| LineError::InvalidValue {
            key: line.key.to_string(),
            value: line.value.to_string(),
        })
}
