//! Fuzz target for pack file parsing.
//!
//! Tests that the pack parser handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = gitwire_protocol::PackParser::new(data);
    let _ = parser.parse();
});
