//! Text normalization for game server output.
//!
//! Servers interleave ANSI colour codes, telnet negotiation and bells with the
//! text a test actually wants to look at. Everything that matches patterns or
//! detects prompts runs on the output of [`normalize`].

use std::borrow::Cow;

/// Telnet "interpret as command" escape.
const IAC: u8 = 255;
/// Subnegotiation begin.
const SB: u8 = 250;
/// Subnegotiation end.
const SE: u8 = 240;
/// WILL, WONT, DO and DONT all carry one option byte.
const NEGOTIATION: std::ops::RangeInclusive<u8> = 251..=254;

/// Remove telnet command, negotiation and subnegotiation sequences.
///
/// Truncated sequences at the end of the input are dropped, so a chunk that
/// ends mid-negotiation never leaks option bytes into the text.
#[must_use]
pub fn strip_telnet(raw: &[u8]) -> Cow<'_, [u8]> {
    if !raw.contains(&IAC) {
        return Cow::Borrowed(raw);
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != IAC {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        i = match raw.get(i + 1) {
            None => raw.len(),
            Some(&cmd) if NEGOTIATION.contains(&cmd) => i + 3,
            Some(&SB) => raw[i + 2..]
                .windows(2)
                .position(|w| w == [IAC, SE])
                .map_or(raw.len(), |end| i + 2 + end + 2),
            // IAC IAC is an escaped 0xFF data byte, which is never valid text.
            Some(_) => i + 2,
        };
    }
    Cow::Owned(out)
}

/// Remove ANSI escape sequences (colours, cursor movement, OSC titles).
#[must_use]
pub fn strip_ansi(raw: &[u8]) -> Vec<u8> {
    strip_ansi_escapes::strip(raw)
}

/// Fully clean server output for comparison.
///
/// Removes telnet sequences, ANSI codes, bells and carriage returns.
#[must_use]
pub fn normalize(raw: &[u8]) -> String {
    let text = strip_telnet(raw);
    let text = strip_ansi(&text);
    String::from_utf8_lossy(&text)
        .chars()
        .filter(|c| !matches!(c, '\r' | '\x07'))
        .collect()
}

/// Normalize line endings, collapse runs of blank lines and trim.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(c);
    }
    out.trim().to_string()
}
