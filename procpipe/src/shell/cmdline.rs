//! Direct-exec command-line format.
//!
//! When no shell is involved the engine still has to carry a command line as a single
//! string (templates are expanded into one line, callers may pass a raw argument string).
//! This module defines that string format and turns it back into an argument vector:
//!
//! - tokens are separated by runs of whitespace;
//! - a `"` opens a quoted section in which whitespace is literal;
//! - inside a quoted section `` `` `` stands for a backtick and `` `" `` for a double quote;
//! - quoted and bare pieces that touch are joined into one token (`a"b c"` is `ab c`).
//!
//! [`quote`] produces exactly this format, so `split_arguments(&quote(s))` yields `[s]`.

use regex::Regex;
use std::sync::LazyLock;

static BARE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-/]+$").expect("valid bare token pattern"));

/// Errors raised while splitting a direct-exec command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Command line is empty")]
    Empty,

    #[error("Unterminated quoted section starting at byte {position}: {line}")]
    UnterminatedQuote { line: String, position: usize },
}

/// Quotes `value` for the direct-exec format. Bare tokens pass through unchanged.
pub fn quote(value: &str) -> String {
    if BARE_TOKEN.is_match(value) {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('`', "``").replace('"', "`\""))
    }
}

/// Splits a command line into its command token and the untouched remainder.
///
/// The command is either the first (possibly quoted) token or everything up to the first
/// whitespace run; the remainder keeps its original quoting so it can be split later.
pub fn split_command(line: &str) -> Result<(String, String), ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    let (command, consumed) = next_token(line, 0)?.ok_or(ParseError::Empty)?;
    Ok((command, line[consumed..].trim_start().to_string()))
}

/// Splits an argument string into individual arguments.
pub fn split_arguments(arguments: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut cursor = 0;
    while let Some((token, next)) = next_token(arguments, cursor)? {
        tokens.push(token);
        cursor = next;
    }
    Ok(tokens)
}

/// Reads one token starting at `start`, returning it with the byte offset after it.
fn next_token(input: &str, start: usize) -> Result<Option<(String, usize)>, ParseError> {
    let rest = &input[start..];
    let skipped = rest.len() - rest.trim_start().len();
    let begin = start + skipped;
    if begin >= input.len() {
        return Ok(None);
    }

    let mut token = String::new();
    let mut chars = input[begin..].char_indices().peekable();
    let mut quote_start: Option<usize> = None;

    while let Some((offset, ch)) = chars.next() {
        match (quote_start, ch) {
            (None, c) if c.is_whitespace() => return Ok(Some((token, begin + offset))),
            (None, '"') => quote_start = Some(begin + offset),
            (None, c) => token.push(c),
            (Some(_), '`') => match chars.peek() {
                Some(&(_, next @ ('`' | '"'))) => {
                    token.push(next);
                    chars.next();
                }
                _ => token.push('`'),
            },
            (Some(_), '"') => quote_start = None,
            (Some(_), c) => token.push(c),
        }
    }

    match quote_start {
        Some(position) => Err(ParseError::UnterminatedQuote {
            line: input.to_string(),
            position,
        }),
        None => Ok(Some((token, input.len()))),
    }
}
