#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = udprpc::Envelope::decode(data) {
        let encoded = envelope.encode().expect("decoded envelope re-encodes");
        let again = udprpc::Envelope::decode(&encoded).expect("re-encoded envelope decodes");
        assert_eq!(envelope, again);
    }
});
