//! Fuzz target for request and reply parsing.
//!
//! Arbitrary bytes read from the socket must never panic the parser.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mudprod::protocol::{Reply, Request};

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(request) = Request::parse(line) {
            // Whatever parses must survive a round trip.
            let json = serde_json::to_string(&request).expect("serialize request");
            assert_eq!(Request::parse(&json).ok(), Some(request));
        }
        let _ = serde_json::from_str::<Reply>(line);
    }

    let _ = serde_json::from_slice::<Reply>(data);
});
