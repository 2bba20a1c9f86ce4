//! A utility module for parsing human-readable duration strings like `10s`,
//! `5min` or `24h` into [std::time::Duration] values.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::time::Duration;

/// An error that can occur while parsing a human-readable duration string.
#[derive(Debug)]
pub enum ParserError {
    /// An error that occurred while parsing an integer value.
    ParseIntError(ParseIntError),
    /// An invalid unit was encountered.
    InvalidUnit(String),
    /// The input string consists only of whitespace.
    OnlyWhitespace,
}

impl Display for ParserError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParserError::ParseIntError(e) => write!(f, "Failed to parse integer: {e}"),
            ParserError::InvalidUnit(unit) => write!(f, "Invalid duration unit: '{unit}'"),
            ParserError::OnlyWhitespace => write!(f, "Input consists only of whitespace"),
        }
    }
}

impl Error for ParserError {}

impl From<ParseIntError> for ParserError {
    fn from(e: ParseIntError) -> Self {
        ParserError::ParseIntError(e)
    }
}

/// Parses a human-readable duration string into a [Duration].
///
/// Multiple components are summed, so `1h 30min` is ninety minutes. A bare
/// number counts as seconds; `0` is the zero duration.
pub fn parse_duration_from_str(input: &str) -> Result<Duration, ParserError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParserError::OnlyWhitespace);
    }

    let mut pos = 0;
    let mut accumulator = Duration::ZERO;
    while pos < input.len() {
        pos += next_token(&input[pos..], u8::is_ascii_whitespace).len();
        if pos >= input.len() {
            break;
        }
        let value_token = next_token(&input[pos..], u8::is_ascii_digit);
        pos += value_token.len();
        let unit_token = next_token(&input[pos..], u8::is_ascii_alphabetic);
        pos += unit_token.len();
        let value: u64 = value_token.parse()?;
        let unit_millis = parse_unit_from_str(unit_token)?;
        accumulator += Duration::from_millis(value.saturating_mul(unit_millis));
    }
    Ok(accumulator)
}

fn next_token(input: &str, predicate: impl FnMut(&u8) -> bool) -> &str {
    &input[..input
        .as_bytes()
        .iter()
        .copied()
        .take_while(predicate)
        .count()]
}

/// Returns the unit's length in milliseconds.
fn parse_unit_from_str(unit: &str) -> Result<u64, ParserError> {
    match unit {
        "ms" => Ok(1),
        "" | "s" | "sec" | "secs" => Ok(1_000),
        "m" | "min" | "mins" => Ok(60 * 1_000),
        "h" | "hr" | "hour" | "hours" => Ok(60 * 60 * 1_000),
        "d" | "day" | "days" => Ok(24 * 60 * 60 * 1_000),
        _ => Err(ParserError::InvalidUnit(unit.to_string())),
    }
}
