//! Fuzz target: network device name validation.
//!
//! Whatever the validator accepts must be safe to pass to `ip` as a single
//! argument.

#![no_main]

use aether_core::validate_device_name;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };
    if validate_device_name(name).is_ok() {
        assert!(!name.is_empty() && name.len() <= 15);
        assert!(name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'));
    }
});
