//! Fuzz target for Frame::decode
//!
//! Arbitrary bytes must decode to a frame or an error, never a panic. A frame
//! that decodes must re-encode to the exact bytes it consumed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relaydrop_proto::Frame;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };

    let encoded = frame.to_vec().expect("decoded frame must re-encode");
    assert_eq!(encoded.as_slice(), &data[..encoded.len()]);
});
