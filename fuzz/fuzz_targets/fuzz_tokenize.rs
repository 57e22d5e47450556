#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(expr) = std::str::from_utf8(data) {
        // The scanner must never panic; its only error is a malformed
        // numeric literal.
        let _ = statusexpr::tokenize(expr);
    }
});
