//! Fuzz target: systemd `ExecStart=` argument escaping.
//!
//! Escaped output is never empty and never holds a raw newline. Unquoted
//! output is a single whitespace-free token.

#![no_main]

use aether_compute::escape_exec_arg;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(arg) = std::str::from_utf8(data) else {
        return;
    };
    let escaped = escape_exec_arg(arg);
    assert!(!escaped.is_empty(), "empty arguments must stay visible");
    assert!(!escaped.contains('\n'), "newline survived escaping: {escaped:?}");
    if !escaped.starts_with('\'') {
        assert!(
            !escaped.contains(char::is_whitespace),
            "unquoted token contains whitespace: {escaped:?}"
        );
    }
});
