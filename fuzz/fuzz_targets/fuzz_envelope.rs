#![no_main]

use brokerlink::core::packet::Envelope;
use brokerlink::core::serialization::WireFormat;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz envelope decoding; whatever decodes must decode again after re-encoding
    if let Ok(envelope) = Envelope::from_bytes(data) {
        let again = Envelope::from_bytes(&envelope.to_bytes());
        assert_eq!(again.ok(), Some(envelope));
    }
});
