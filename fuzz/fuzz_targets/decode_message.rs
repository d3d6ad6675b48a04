#![no_main]

use collab_crdt::sync::{ValidationLimits, WireMessage, decode_validated};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = WireMessage::decode(data);
    if let Ok(message) = decode_validated(data, &ValidationLimits::default()) {
        // Anything accepted must survive a re-encode.
        let bytes = message.encode().unwrap();
        assert_eq!(WireMessage::decode(&bytes).unwrap(), message);
    }
});
