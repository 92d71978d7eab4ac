//! Matchers for tests that drive a game server.
//!
//! Failures carry an excerpt of the output so a broken expectation shows
//! what the server actually said.

use crate::response::Response;
use regex::RegexBuilder;
use std::ops::{Bound, RangeBounds};
use thiserror::Error;

/// Characters of output quoted in failure messages.
pub const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("'{pattern}' not found in response\nResponse:\n{excerpt}")]
    Missing { pattern: String, excerpt: String },

    #[error("'{pattern}' was found but should not be present\nResponse:\n{excerpt}")]
    Unexpected { pattern: String, excerpt: String },

    #[error("no prompt detected in response\nResponse:\n{excerpt}")]
    NoPrompt { excerpt: String },

    #[error("expected {expected} lines, got {count}\nLines: {lines:?}")]
    LineCount {
        expected: String,
        count: usize,
        lines: Vec<String>,
    },

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Anything assertions can read normalized text from.
pub trait Text {
    fn text(&self) -> &str;
}

impl Text for Response {
    fn text(&self) -> &str {
        self.clean()
    }
}

impl Text for str {
    fn text(&self) -> &str {
        self
    }
}

impl Text for String {
    fn text(&self) -> &str {
        self
    }
}

/// What to look for. A plain `&str` is a case-sensitive substring.
#[derive(Debug, Clone, Copy)]
pub struct Pattern<'a> {
    source: &'a str,
    regex: bool,
    ignore_case: bool,
}

impl<'a> Pattern<'a> {
    #[must_use]
    pub const fn literal(source: &'a str) -> Self {
        Self {
            source,
            regex: false,
            ignore_case: false,
        }
    }

    #[must_use]
    pub const fn regex(source: &'a str) -> Self {
        Self {
            source,
            regex: true,
            ignore_case: false,
        }
    }

    #[must_use]
    pub const fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    fn is_match(&self, text: &str) -> Result<bool, AssertionError> {
        if self.regex {
            let re = RegexBuilder::new(self.source)
                .case_insensitive(self.ignore_case)
                .build()?;
            Ok(re.is_match(text))
        } else if self.ignore_case {
            Ok(text.to_lowercase().contains(&self.source.to_lowercase()))
        } else {
            Ok(text.contains(self.source))
        }
    }
}

impl<'a> From<&'a str> for Pattern<'a> {
    fn from(source: &'a str) -> Self {
        Self::literal(source)
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

/// Fail unless the output contains `pattern`.
pub fn assert_contains<'a, T, P>(output: &T, pattern: P) -> Result<(), AssertionError>
where
    T: Text + ?Sized,
    P: Into<Pattern<'a>>,
{
    let pattern = pattern.into();
    let text = output.text();
    if pattern.is_match(text)? {
        Ok(())
    } else {
        Err(AssertionError::Missing {
            pattern: pattern.source.to_string(),
            excerpt: excerpt(text),
        })
    }
}

/// Fail if the output contains `pattern`.
pub fn assert_not_contains<'a, T, P>(output: &T, pattern: P) -> Result<(), AssertionError>
where
    T: Text + ?Sized,
    P: Into<Pattern<'a>>,
{
    let pattern = pattern.into();
    let text = output.text();
    if pattern.is_match(text)? {
        Err(AssertionError::Unexpected {
            pattern: pattern.source.to_string(),
            excerpt: excerpt(text),
        })
    } else {
        Ok(())
    }
}

/// Match a regex and return its capture groups, whole match first.
///
/// Groups that did not participate are `None`.
pub fn assert_matches<T>(output: &T, pattern: &str) -> Result<Vec<Option<String>>, AssertionError>
where
    T: Text + ?Sized,
{
    let text = output.text();
    let re = RegexBuilder::new(pattern).build()?;
    re.captures(text).map_or_else(
        || {
            Err(AssertionError::Missing {
                pattern: pattern.to_string(),
                excerpt: excerpt(text),
            })
        },
        |caps| {
            Ok(caps
                .iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect())
        },
    )
}

/// Fail unless a prompt was detected.
pub fn assert_prompt(response: &Response) -> Result<(), AssertionError> {
    if response.prompt_detected() {
        Ok(())
    } else {
        Err(AssertionError::NoPrompt {
            excerpt: excerpt(response.clean()),
        })
    }
}

/// Fail unless the number of non-blank lines falls in `range`.
pub fn assert_line_count<T, R>(output: &T, range: R) -> Result<(), AssertionError>
where
    T: Text + ?Sized,
    R: RangeBounds<usize>,
{
    let lines: Vec<&str> = output
        .text()
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .collect();
    let count = lines.len();

    if range.contains(&count) {
        return Ok(());
    }

    let lower = match range.start_bound() {
        Bound::Included(n) => format!("at least {n}"),
        Bound::Excluded(n) => format!("more than {n}"),
        Bound::Unbounded => String::new(),
    };
    let upper = match range.end_bound() {
        Bound::Included(n) => format!("at most {n}"),
        Bound::Excluded(n) => format!("fewer than {n}"),
        Bound::Unbounded => String::new(),
    };
    let expected = match (lower.is_empty(), upper.is_empty()) {
        (false, false) => format!("{lower} and {upper}"),
        (false, true) => lower,
        _ => upper,
    };

    Err(AssertionError::LineCount {
        expected,
        count,
        lines: lines.iter().take(10).map(|l| (*l).to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> Response {
        Response::new(
            b"\x1b[1mTown Square\x1b[0m\r\nA fountain bubbles here.\r\nExits: north, south\r\n> ",
            true,
        )
    }

    #[test]
    fn test_contains() {
        let room = room();
        assert!(assert_contains(&room, "fountain").is_ok());
        assert!(assert_contains(&room, "FOUNTAIN").is_err());
        assert!(assert_contains(&room, Pattern::literal("FOUNTAIN").ignore_case()).is_ok());
        assert!(assert_contains(&room, Pattern::regex(r"Exits: \w+")).is_ok());
        assert!(assert_contains("plain text", "text").is_ok());
    }

    #[test]
    fn test_not_contains() {
        let room = room();
        assert!(assert_not_contains(&room, "dragon").is_ok());
        let err = assert_not_contains(&room, "fountain").expect_err("present");
        assert!(err.to_string().contains("should not be present"));
    }

    #[test]
    fn test_failure_excerpt_is_bounded() {
        let long = "x".repeat(2000);
        let err = assert_contains(long.as_str(), "y").expect_err("missing");
        match err {
            AssertionError::Missing { excerpt, .. } => assert_eq!(excerpt.len(), EXCERPT_CHARS),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_matches_returns_groups() {
        let groups = assert_matches(&room(), r"Exits: (\w+), (\w+)( east)?").expect("match");
        assert_eq!(
            groups,
            [
                Some("Exits: north, south".to_string()),
                Some("north".to_string()),
                Some("south".to_string()),
                None
            ]
        );
        assert!(matches!(
            assert_matches(&room(), "("),
            Err(AssertionError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_prompt_and_line_count() {
        let room = room();
        assert!(assert_prompt(&room).is_ok());
        assert!(assert_prompt(&Response::empty()).is_err());

        assert!(assert_line_count(&room, 3..=4).is_ok());
        assert!(assert_line_count(&room, 4..).is_ok());
        let err = assert_line_count(&room, ..2).expect_err("too many");
        assert!(err.to_string().starts_with("expected fewer than 2 lines, got 4"));
    }
}
