//! Structured output of a read from the game server.

use crate::normalize::normalize;
use std::fmt;

/// Output received from the server, as read and as normalized.
///
/// Built fresh by every read operation and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    raw: String,
    clean: String,
    prompt_detected: bool,
    lines: Vec<String>,
}

impl Response {
    /// Build a response from received bytes.
    #[must_use]
    pub fn new(raw: &[u8], prompt_detected: bool) -> Self {
        let clean = normalize(raw);
        let lines = clean
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self {
            raw: String::from_utf8_lossy(raw).into_owned(),
            clean,
            prompt_detected,
            lines,
        }
    }

    /// A response carrying no output and no prompt.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Output exactly as received (lossily decoded).
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Normalized output.
    #[must_use]
    pub fn clean(&self) -> &str {
        &self.clean
    }

    #[must_use]
    pub const fn prompt_detected(&self) -> bool {
        self.prompt_detected
    }

    /// Non-empty lines of the normalized output.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether the normalized output contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.clean.contains(needle)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_skip_blank() {
        let response = Response::new(b"\x1b[32mYou see:\x1b[0m\r\n\r\n  \r\na sword\r\n> ", true);
        assert_eq!(response.lines(), ["You see:", "a sword", "> "]);
        assert!(response.prompt_detected());
        assert!(response.contains("a sword"));
        assert!(response.raw().contains("\x1b[32m"));
    }

    #[test]
    fn test_empty() {
        let response = Response::empty();
        assert!(response.is_empty());
        assert!(!response.prompt_detected());
        assert!(response.lines().is_empty());
        assert_eq!(response.to_string(), "");
    }
}
