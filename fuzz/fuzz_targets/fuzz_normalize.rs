//! Fuzz target for output cleanup and prompt detection.
//!
//! Uses arbitrary to pair raw server bytes with user-supplied prompt patterns.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mudprod::connection::{DEFAULT_END_CHARS, PromptRule};
use mudprod::normalize::{normalize, normalize_whitespace};
use mudprod::Response;

#[derive(Debug, Arbitrary)]
struct Input {
    raw: Vec<u8>,
    patterns: Vec<String>,
}

fuzz_target!(|input: Input| {
    let clean = normalize(&input.raw);
    assert!(!clean.contains('\r'));

    let _ = normalize_whitespace(&clean);

    if let Ok(rule) = PromptRule::new(&input.patterns, DEFAULT_END_CHARS) {
        let response = Response::new(&input.raw, rule.detect(&clean));
        assert_eq!(response.clean(), clean);
    }
});
