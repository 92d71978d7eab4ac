//! Login handshake configuration.

use regex::{Regex, RegexBuilder};

/// Patterns that indicate a successful login by default.
pub const DEFAULT_SUCCESS_PATTERNS: [&str; 3] = [r">\s*$", r"Exits:", r"reconnected"];

/// Patterns that indicate a failed login by default.
pub const DEFAULT_FAILURE_PATTERNS: [&str; 3] = [r"[Ii]nvalid", r"[Ff]ailed", r"[Ii]ncorrect"];

/// One handshake step: wait for `expect`, then send `send`.
#[derive(Debug, Clone)]
pub struct LoginStep {
    /// Matched case-insensitively against cumulative output.
    pub expect: Regex,
    /// Sent followed by a newline.
    pub send: String,
}

/// Ordered login steps plus the patterns that classify the outcome.
#[derive(Debug, Clone)]
pub struct LoginPlan {
    pub steps: Vec<LoginStep>,
    pub success: Vec<Regex>,
    pub failure: Vec<Regex>,
}

/// How the final login output was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// A failure pattern matched.
    Rejected,
    /// A success pattern matched.
    Accepted,
    /// Nothing matched either way.
    Unrecognized,
}

impl LoginPlan {
    /// Build a plan from `(expect, send)` pairs using the default
    /// success and failure patterns.
    pub fn new<I, P, T>(steps: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (P, T)>,
        P: AsRef<str>,
        T: Into<String>,
    {
        let steps = steps
            .into_iter()
            .map(|(expect, send)| -> Result<LoginStep, regex::Error> {
                Ok(LoginStep {
                    expect: RegexBuilder::new(expect.as_ref())
                        .case_insensitive(true)
                        .build()?,
                    send: send.into(),
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            steps,
            success: compile(DEFAULT_SUCCESS_PATTERNS)?,
            failure: compile(DEFAULT_FAILURE_PATTERNS)?,
        })
    }

    /// Replace the success patterns.
    pub fn with_success<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.success = compile(patterns)?;
        Ok(self)
    }

    /// Replace the failure patterns.
    pub fn with_failure<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.failure = compile(patterns)?;
        Ok(self)
    }

    /// Classify the normalized output that followed the last step.
    ///
    /// Failure patterns are checked first.
    #[must_use]
    pub fn classify(&self, clean: &str) -> LoginOutcome {
        if self.failure.iter().any(|re| re.is_match(clean)) {
            LoginOutcome::Rejected
        } else if self.success.iter().any(|re| re.is_match(clean)) {
            LoginOutcome::Accepted
        } else {
            LoginOutcome::Unrecognized
        }
    }
}

fn compile<I, S>(patterns: I) -> Result<Vec<Regex>, regex::Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns.into_iter().map(|p| Regex::new(p.as_ref())).collect()
}
