//! Fuzz target for D-Bus signature parsing.
//!
//! Ensures that arbitrary signature strings never cause panics and that
//! accepted signatures render back to their input.

#![no_main]

use buskit::signature::MemberSignature;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(signature) = MemberSignature::parse(s) {
            assert_eq!(signature.to_string(), s);
        }
    }
});
