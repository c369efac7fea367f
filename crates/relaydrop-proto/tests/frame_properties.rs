//! Property-based tests for frame and payload decoding
//!
//! The relay decodes untrusted bytes from every connection, so decoding must
//! reject malformed input with an error and never panic.

use bytes::Bytes;
use proptest::prelude::*;
use relaydrop_proto::{
    Frame, FrameHeader, Opcode, Payload, ProtocolError,
    payloads::transfer::{ChunkTransfer, ReceiveChunk},
};

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop::sample::select(Opcode::ALL.to_vec())
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (
        arbitrary_opcode(),
        any::<u32>(),                                // request_id
        any::<u64>(),                                // sender_id
        any::<Option<u64>>(),                        // recipient_id
        prop::collection::vec(any::<u8>(), 0..1024), // payload up to 1KB
    )
        .prop_map(|(opcode, request_id, sender_id, recipient_id, payload)| {
            let mut header = FrameHeader::new(opcode);
            header.set_request_id(request_id);
            header.set_sender_id(sender_id);
            header.set_recipient_id(recipient_id);
            Frame::new(header, Bytes::from(payload))
        })
}

#[test]
fn prop_decode_arbitrary_bytes_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..256))| {
        if let Ok(frame) = Frame::decode(&bytes) {
            // Whatever parsed must respect the declared size.
            prop_assert_eq!(frame.payload.len(), frame.header.payload_size() as usize);
            let _ = Payload::from_frame(&frame);
        }
    });
}

#[test]
fn prop_every_strict_prefix_is_rejected() {
    proptest!(|(frame in arbitrary_frame(), cut in any::<prop::sample::Index>())| {
        let wire = frame.to_vec().expect("encode should succeed");
        let len = cut.index(wire.len());

        let result = Frame::decode(&wire[..len]);
        prop_assert!(result.is_err(), "prefix of {} bytes decoded", len);
    });
}

#[test]
fn prop_routing_fields_survive_round_trip() {
    proptest!(|(frame in arbitrary_frame())| {
        let wire = frame.to_vec().expect("encode should succeed");
        let decoded = Frame::decode(&wire).expect("decode should succeed");

        prop_assert_eq!(decoded.header.opcode_enum(), frame.header.opcode_enum());
        prop_assert_eq!(decoded.header.request_id(), frame.header.request_id());
        prop_assert_eq!(decoded.header.sender_id(), frame.header.sender_id());
        prop_assert_eq!(decoded.header.recipient_id(), frame.header.recipient_id());
        prop_assert_eq!(decoded.payload, frame.payload);
    });
}

#[test]
fn prop_chunk_bytes_are_preserved() {
    proptest!(|(
        file_index in any::<u32>(),
        chunk_index in any::<u32>(),
        chunk in prop::collection::vec(any::<u8>(), 0..4096),
    )| {
        let payload = Payload::ChunkTransfer(ChunkTransfer {
            room: "abc123".to_string(),
            file_index,
            chunk_index,
            chunk: Bytes::from(chunk.clone()),
            recipient: None,
        });

        let frame = payload.into_frame(FrameHeader::new(Opcode::ChunkTransfer)).expect("encode");
        let wire = frame.to_vec().expect("encode");
        let decoded = Payload::from_frame(&Frame::decode(&wire).expect("decode")).expect("payload");

        let Payload::ChunkTransfer(decoded) = decoded else {
            return Err(TestCaseError::fail("wrong payload variant"));
        };
        prop_assert_eq!(decoded.file_index, file_index);
        prop_assert_eq!(decoded.chunk_index, chunk_index);
        prop_assert_eq!(decoded.chunk.as_ref(), chunk.as_slice());
    });
}

#[test]
fn receive_chunk_rejects_missing_fields() {
    let frame = Payload::ReceiveChunk(ReceiveChunk {
        room: "abc123".to_string(),
        file_index: 0,
        chunk_index: 0,
        chunk: Bytes::from_static(b"x"),
    })
    .into_frame(FrameHeader::new(Opcode::ReceiveChunk))
    .expect("encode");

    // Truncate the CBOR body but keep the frame well-formed.
    let body = frame.payload.slice(..frame.payload.len() - 3);
    let truncated = Frame::new(frame.header, body);

    let result = Payload::from_frame(&truncated);
    assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
}
