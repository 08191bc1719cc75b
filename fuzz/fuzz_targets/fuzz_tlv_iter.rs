#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut cursor = udprpc::TlvCursor::new(data);
    while let Some(item) = cursor.next() {
        match item {
            Ok(tlv) if tlv.type_id == udprpc::TlvType::End as u8 => break,
            Ok(tlv) => assert!(tlv.value.len() <= data.len()),
            Err(_) => break,
        }
    }
    assert!(cursor.consumed_len() <= data.len());
});
