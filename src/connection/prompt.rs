//! Prompt detection rules.

use regex::Regex;

/// Characters that end a prompt on most servers.
pub const DEFAULT_END_CHARS: &str = ">]:";

/// Patterns checked after the end characters.
pub const DEFAULT_PATTERNS: [&str; 3] = [r">\s*$", r":\s*$", r"\]\s*$"];

/// Decides whether the server is waiting for input.
///
/// Resolution order is fixed: a custom predicate wins outright; otherwise the
/// right-trimmed text is checked against the terminal characters, then the
/// regex patterns in order.
#[derive(Debug, Clone)]
pub struct PromptRule {
    patterns: Vec<Regex>,
    end_chars: Vec<char>,
    predicate: Option<fn(&str) -> bool>,
}

impl PromptRule {
    /// Build a rule from regex patterns and terminal characters.
    pub fn new<I, S>(patterns: I, end_chars: &str) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            patterns,
            end_chars: end_chars.chars().collect(),
            predicate: None,
        })
    }

    /// A rule that defers entirely to `predicate`.
    #[must_use]
    pub const fn custom(predicate: fn(&str) -> bool) -> Self {
        Self {
            patterns: Vec::new(),
            end_chars: Vec::new(),
            predicate: Some(predicate),
        }
    }

    /// Detect a prompt at the end of normalized text.
    #[must_use]
    pub fn detect(&self, clean: &str) -> bool {
        if let Some(predicate) = self.predicate {
            return predicate(clean);
        }

        let trimmed = clean.trim_end();
        if trimmed
            .chars()
            .next_back()
            .is_some_and(|c| self.end_chars.contains(&c))
        {
            return true;
        }

        self.patterns.iter().any(|re| re.is_match(trimmed))
    }
}

impl Default for PromptRule {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            end_chars: DEFAULT_END_CHARS.chars().collect(),
            predicate: None,
        }
    }
}
