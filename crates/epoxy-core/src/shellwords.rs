//! Shell-style word splitting for command strings.
//!
//! Command entries written as single strings are split into argv form before
//! execution. Splitting honors single quotes (no escapes inside), double
//! quotes (backslash escapes `\"` and `\\`), and backslash escapes in bare
//! words. An unquoted `#` at the start of a word begins a comment that
//! swallows the rest of the line, so a command string of `# note` yields an
//! empty argv.

use thiserror::Error;

/// Errors raised while splitting a command string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    /// The string ended inside a quoted section.
    #[error("unclosed quote in command: {0:?}")]
    UnclosedQuote(String),

    /// The string ended immediately after a backslash.
    #[error("trailing backslash in command: {0:?}")]
    TrailingEscape(String),
}

/// Splits `line` into whitespace-separated words with shell-style quoting.
///
/// # Errors
///
/// Returns an error when a quote is left unclosed or the line ends in a bare
/// backslash.
pub fn split(line: &str) -> Result<Vec<String>, SplitError> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    'words: loop {
        // Skip inter-word whitespace.
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };
        if first == '#' {
            // Comment: discard everything up to the end of the line.
            break;
        }

        let mut word = String::new();
        loop {
            let Some(c) = chars.next() else {
                words.push(word);
                break 'words;
            };
            match c {
                c if c.is_whitespace() => break,
                '\'' => loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => word.push(inner),
                        None => return Err(SplitError::UnclosedQuote(line.to_string())),
                    }
                },
                '"' => loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => word.push(escaped),
                            Some(other) => {
                                word.push('\\');
                                word.push(other);
                            },
                            None => return Err(SplitError::UnclosedQuote(line.to_string())),
                        },
                        Some(inner) => word.push(inner),
                        None => return Err(SplitError::UnclosedQuote(line.to_string())),
                    }
                },
                '\\' => match chars.next() {
                    Some(escaped) => word.push(escaped),
                    None => return Err(SplitError::TrailingEscape(line.to_string())),
                },
                other => word.push(other),
            }
        }
        words.push(word);
    }

    Ok(words)
}
