#![no_main]

use libfuzzer_sys::fuzz_target;
use tunnel_core::proto::message::MessageCodec;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must only ever produce messages or an error, never a panic.
    let mut codec = MessageCodec::new();
    if let Ok(messages) = codec.decode(data) {
        for message in messages {
            let _ = codec.encode(&message);
        }
    }
});
