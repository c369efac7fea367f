//! Fuzz target for Payload::from_frame
//!
//! Feeds arbitrary payload bytes under every opcode to find:
//! - Panics in the payload decoders
//! - Length prefixes that over-read
//! - Chunk payloads accepted past the chunk size limit
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use relaydrop_proto::{Frame, FrameHeader, Opcode, Payload};

fuzz_target!(|data: &[u8]| {
    for opcode in Opcode::ALL {
        let mut header = FrameHeader::new(opcode);
        header.set_sender_id(1);

        let frame = Frame::new(header, Bytes::copy_from_slice(data));

        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.opcode(), opcode);
        }
    }
});
