//! Fuzz target: inbound command envelope decoding.
//!
//! Arbitrary bus payloads must either decode or be rejected; a decoded
//! command always maps back to the name it was published under.

#![no_main]

use aether_core::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::decode(data) else {
        return;
    };
    let kind = envelope.kind;
    if let Ok(command) = envelope.into_command() {
        assert_eq!(command.kind(), kind, "decoded command must keep its name");
    }
});
