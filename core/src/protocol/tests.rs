//! Frame-level codec tests: exact round trips, truncation and socket framing.

use super::amqp::frame::{FRAME_END, FRAME_METHOD};
use super::*;
use bytes::{BufMut, Bytes, BytesMut};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn sample_frames() -> Vec<Frame> {
    vec![
        Frame::method(
            0,
            Method::ConnectionStart {
                version_major: 0,
                version_minor: 9,
                server_properties: FieldTable::new()
                    .with("product", FieldValue::string("fluxq"))
                    .with("capabilities", FieldValue::Table(FieldTable::new())),
                mechanisms: Bytes::from_static(b"PLAIN ANONYMOUS"),
                locales: Bytes::from_static(b"en_US"),
            },
        ),
        Frame::method(
            1,
            Method::BasicPublish {
                ticket: 0,
                exchange: "amq.direct".into(),
                routing_key: "orders".into(),
                mandatory: true,
                immediate: false,
            },
        ),
        Frame::header(1, ContentHeader::basic(5, BasicProperties::persistent())),
        Frame::content(1, Bytes::from_static(b"hello")),
        Frame::heartbeat(),
        Frame::method(
            7,
            Method::DtxStart {
                xid: Xid::new(4, &b"global"[..], &b"branch"[..]),
                join: false,
                resume: true,
            },
        ),
    ]
}

#[test]
fn test_encode_then_decode_is_identity() {
    for frame in sample_frames() {
        let bytes = frame.to_bytes();
        let (decoded, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
        assert_eq!(decoded.to_bytes(), bytes);
    }
}

#[test]
fn test_every_strict_prefix_is_truncated() {
    for frame in sample_frames() {
        let bytes = frame.to_bytes();
        for cut in 0..bytes.len() {
            match Frame::decode(&bytes[..cut]) {
                Err(FramingError::Truncated { needed, available }) => {
                    assert_eq!(available, cut);
                    assert!(needed > available);
                }
                other => panic!("prefix of {cut} bytes decoded to {other:?}"),
            }
        }
    }
}

#[test]
fn test_bad_frame_end() {
    let mut bytes = BytesMut::from(&Frame::heartbeat().to_bytes()[..]);
    let last = bytes.len() - 1;
    bytes[last] = 0x00;
    assert_eq!(
        Frame::decode(&bytes).unwrap_err(),
        FramingError::InvalidFrameEnd(0)
    );
}

#[test]
fn test_unknown_frame_type() {
    let raw = [9u8, 0, 0, 0, 0, 0, 0, FRAME_END];
    let err = Frame::decode(&raw).unwrap_err();
    assert_eq!(err, FramingError::UnknownFrameType(9));
    assert_eq!(err.condition(), ErrorCondition::FramingError);
}

#[test]
fn test_malformed_method_inside_valid_length() {
    // basic.publish whose exchange short string claims 200 bytes
    let mut raw = BytesMut::new();
    raw.put_u8(FRAME_METHOD);
    raw.put_u16(1);
    raw.put_u32(7);
    raw.put_slice(&[0, 60, 0, 40, 0, 0, 200]);
    raw.put_u8(FRAME_END);
    let err = Frame::decode(&raw).unwrap_err();
    assert!(matches!(err, FramingError::Truncated { .. }));
}

#[test]
fn test_codec_reads_header_then_frames_in_pieces() {
    let mut codec = AmqpFrameCodec::new(0);
    let mut buf = BytesMut::new();
    buf.put_slice(b"AMQP\x00\x00\x09");
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.put_u8(1);
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Inbound::ProtocolHeader(ProtocolHeader::AMQP_0_9_1))
    );

    let frame = sample_frames().remove(1);
    let bytes = frame.to_bytes();
    buf.put_slice(&bytes[..5]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.put_slice(&bytes[5..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Frame(frame)));
    assert!(buf.is_empty());
}

#[test]
fn test_codec_rejects_non_amqp_header() {
    let mut codec = AmqpFrameCodec::new(0);
    let mut buf = BytesMut::from(&b"GET / HT"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(AmqpCodecError::Framing(FramingError::ProtocolHeader(_)))
    ));
}

#[test]
fn test_codec_enforces_frame_max() {
    let mut codec = AmqpFrameCodec::frames_only(16);
    let mut buf = BytesMut::new();
    codec
        .encode(Frame::content(1, Bytes::from(vec![0u8; 32])), &mut buf)
        .unwrap();
    assert!(matches!(
        codec.decode(&mut buf),
        Err(AmqpCodecError::Framing(FramingError::FrameTooLarge {
            size: 40,
            max: 16
        }))
    ));
}

fn arb_shortstr() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._-]{0,40}"
}

fn arb_method() -> impl Strategy<Value = Method> {
    prop_oneof![
        (any::<u16>(), any::<u32>(), any::<u16>()).prop_map(|(channel_max, frame_max, heartbeat)| {
            Method::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            }
        }),
        (arb_shortstr(), arb_shortstr(), any::<bool>(), any::<bool>()).prop_map(
            |(exchange, routing_key, mandatory, immediate)| Method::BasicPublish {
                ticket: 0,
                exchange,
                routing_key,
                mandatory,
                immediate,
            }
        ),
        (arb_shortstr(), any::<u64>(), any::<bool>(), arb_shortstr()).prop_map(
            |(consumer_tag, delivery_tag, redelivered, routing_key)| Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange: String::new(),
                routing_key,
            }
        ),
        (any::<u64>(), any::<bool>(), any::<bool>()).prop_map(|(delivery_tag, multiple, requeue)| {
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            }
        }),
        (arb_shortstr(), any::<i8>(), any::<i64>()).prop_map(|(queue, small, big)| {
            Method::QueueDeclare {
                ticket: 0,
                queue,
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new()
                    .with("b", FieldValue::ShortShortInt(i32::from(small)))
                    .with("l", FieldValue::LongLongInt(big)),
            }
        }),
    ]
}

proptest! {
    #[test]
    fn prop_method_frame_roundtrip(channel in any::<u16>(), method in arb_method()) {
        let frame = Frame::method(channel, method);
        let bytes = frame.to_bytes();
        let (decoded, consumed) = Frame::decode(&bytes).unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded.to_bytes(), bytes);
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn prop_body_frame_truncation_never_panics(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = Frame::content(3, Bytes::from(body)).to_bytes();
        let at = cut.index(bytes.len());
        let truncated = matches!(
            Frame::decode(&bytes[..at]),
            Err(FramingError::Truncated { .. })
        );
        prop_assert!(truncated);
    }

    #[test]
    fn prop_arbitrary_input_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = Frame::decode(&raw);
    }
}
