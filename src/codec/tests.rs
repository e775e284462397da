//! Codec tests
//!
//! Round-trip and malformed-input coverage for every packet kind, plus
//! the data-representation primitives (remaining length, strict UTF-8
//! strings).

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use super::{
    read_string, read_variable_int, valid_mqtt_string, write_variable_int, Decoder, Encoder,
};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, SubscribeTopic, UnsubAck, Unsubscribe,
    Will,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len(), "decoder must consume the whole packet");
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

fn round_trip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// Remaining length
// ============================================================================

#[test]
fn remaining_length_fixed_vectors() {
    let vectors: &[(u32, &[u8])] = &[
        (0, &[0x00]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (16_383, &[0xFF, 0x7F]),
        (16_384, &[0x80, 0x80, 0x01]),
        (2_097_151, &[0xFF, 0xFF, 0x7F]),
        (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
        (268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F]),
    ];

    for &(value, bytes) in vectors {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, value).unwrap();
        assert_eq!(&buf[..], bytes, "encoding of {}", value);
        assert_eq!(written, bytes.len());

        let (decoded, consumed) = read_variable_int(bytes).unwrap();
        assert_eq!(decoded, value, "decoding of {:?}", bytes);
        assert_eq!(consumed, bytes.len());
    }
}

#[test]
fn remaining_length_rejects_fifth_continuation_byte() {
    let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
    assert_eq!(
        read_variable_int(&buf),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn remaining_length_incomplete_needs_more_data() {
    assert_eq!(read_variable_int(&[0x80]), Err(DecodeError::InsufficientData));
}

// ============================================================================
// Strict UTF-8 strings
// ============================================================================

#[test]
fn string_rejects_control_characters() {
    for b in 0x00u8..=0x1F {
        let s = String::from_utf8(vec![b'a', b]).unwrap();
        assert!(!valid_mqtt_string(&s), "byte {:#04x} must be invalid", b);
    }
    // 0x7F..=0x9F as chars (U+007F..U+009F)
    for c in '\u{7F}'..='\u{9F}' {
        let s = format!("a{}", c);
        assert!(!valid_mqtt_string(&s), "char {:?} must be invalid", c);
    }
    assert!(!valid_mqtt_string("a\u{FEFF}b"));
    assert!(valid_mqtt_string("plain/topic name-42"));
}

#[test]
fn read_string_rejects_ill_formed_utf8() {
    // length prefix says 2 bytes, content is a lone continuation byte
    let buf = [0x00, 0x02, 0x31, 0xE2];
    assert_eq!(read_string(&buf), Err(DecodeError::InvalidUtf8));
}

#[test]
fn read_string_rejects_null() {
    let buf = [0x00, 0x02, 0x00, 0x00];
    assert_eq!(read_string(&buf), Err(DecodeError::InvalidUtf8));
}

#[test]
fn read_string_short_buffer() {
    let buf = [0x00, 0x02, 0x31];
    assert_eq!(read_string(&buf), Err(DecodeError::InsufficientData));
}

// ============================================================================
// CONNECT
// ============================================================================

#[test]
fn connect_minimal_round_trip() {
    round_trip(Packet::Connect(Box::new(Connect {
        client_id: String::new(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })));
}

#[test]
fn connect_full_round_trip() {
    round_trip(Packet::Connect(Box::new(Connect {
        client_id: "bench-client-7".to_string(),
        clean_session: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
        will: Some(Will {
            topic: "status/bench-client-7".to_string(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    })));
}

#[test]
fn connect_rejects_bad_protocol_name() {
    let mut buf = BytesMut::new();
    // fixed header, remaining length 12
    buf.extend_from_slice(&[0x10, 0x0C]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQXX");
    buf.extend_from_slice(&[0x04, 0x02, 0x00, 0x3C, 0x00, 0x00]);
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidProtocolName));
}

#[test]
fn connect_rejects_bad_protocol_level() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0C]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQTT");
    buf.extend_from_slice(&[0x03, 0x02, 0x00, 0x3C, 0x00, 0x00]);
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidProtocolLevel(3)));
}

#[test]
fn connect_rejects_reserved_flag() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0C]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQTT");
    // reserved bit 0 set
    buf.extend_from_slice(&[0x04, 0x03, 0x00, 0x3C, 0x00, 0x00]);
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn connect_rejects_password_without_username() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0E]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQTT");
    // password flag set, username flag clear
    buf.extend_from_slice(&[0x04, 0x42, 0x00, 0x3C, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// CONNACK
// ============================================================================

#[test]
fn connack_round_trip() {
    round_trip(Packet::ConnAck(ConnAck::accepted(true)));
    round_trip(Packet::ConnAck(ConnAck::refused(
        ConnectReturnCode::IdentifierRejected,
    )));
}

#[test]
fn connack_wire_bytes() {
    let encoded = encode_packet(&Packet::ConnAck(ConnAck::accepted(false)));
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x00]);

    let encoded = encode_packet(&Packet::ConnAck(ConnAck::refused(
        ConnectReturnCode::NotAuthorized,
    )));
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x05]);
}

// ============================================================================
// PUBLISH
// ============================================================================

#[test]
fn publish_qos0_round_trip() {
    round_trip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "sensor/temp".into(),
        packet_id: None,
        payload: Bytes::from_static(b"21.5"),
    }));
}

#[test]
fn publish_qos2_round_trip() {
    round_trip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: true,
        topic: "a/b/c".into(),
        packet_id: Some(42),
        payload: Bytes::from_static(&[0x00, 0x01, 0x02]),
    }));
}

#[test]
fn publish_empty_payload_round_trip() {
    round_trip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "clear/me".into(),
        packet_id: Some(1),
        payload: Bytes::new(),
    }));
}

#[test]
fn publish_rejects_wildcard_topic() {
    // PUBLISH to "a/+" (QoS 0)
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x30, 0x05, 0x00, 0x03]);
    buf.extend_from_slice(b"a/+");
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::InvalidTopic(_))
    ));
}

#[test]
fn publish_rejects_dup_on_qos0() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x38, 0x03, 0x00, 0x01]);
    buf.extend_from_slice(b"a");
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_rejects_qos3() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x36, 0x05, 0x00, 0x01]);
    buf.extend_from_slice(b"a");
    buf.extend_from_slice(&[0x00, 0x01]);
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn publish_rejects_zero_packet_id() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x32, 0x05, 0x00, 0x01]);
    buf.extend_from_slice(b"a");
    buf.extend_from_slice(&[0x00, 0x00]);
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// Acks
// ============================================================================

#[test]
fn ack_round_trips() {
    round_trip(Packet::PubAck(PubAck::new(7)));
    round_trip(Packet::PubRec(PubRec::new(0xFFFF)));
    round_trip(Packet::PubRel(PubRel::new(9)));
    round_trip(Packet::PubComp(PubComp::new(513)));
    round_trip(Packet::UnsubAck(UnsubAck { packet_id: 3 }));
}

#[test]
fn pubrel_requires_flags_0010() {
    // PUBREL with flags 0000
    let buf = [0x60, 0x02, 0x00, 0x01];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn puback_rejects_flags() {
    let buf = [0x41, 0x02, 0x00, 0x01];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// SUBSCRIBE / SUBACK / UNSUBSCRIBE
// ============================================================================

#[test]
fn subscribe_round_trip() {
    round_trip(Packet::Subscribe(Subscribe {
        packet_id: 10,
        topics: vec![
            SubscribeTopic {
                filter: "name".to_string(),
                qos: QoS::AtLeastOnce,
            },
            SubscribeTopic {
                filter: "a/+/b/#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    }));
}

#[test]
fn subscribe_requires_flags_0010() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x80, 0x08, 0x00, 0x0A, 0x00, 0x03]);
    buf.extend_from_slice(b"a/b");
    buf.extend_from_slice(&[0x01]);
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn subscribe_requires_at_least_one_filter() {
    let buf = [0x82, 0x02, 0x00, 0x0A];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn subscribe_rejects_reserved_qos_bits() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x82, 0x08, 0x00, 0x0A, 0x00, 0x03]);
    buf.extend_from_slice(b"a/b");
    buf.extend_from_slice(&[0x41]);
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn suback_round_trip() {
    round_trip(Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubscribeReturnCode::Granted(QoS::AtLeastOnce),
            SubscribeReturnCode::Failure,
            SubscribeReturnCode::Granted(QoS::AtMostOnce),
        ],
    }));
}

#[test]
fn unsubscribe_round_trip() {
    round_trip(Packet::Unsubscribe(Unsubscribe {
        packet_id: 11,
        filters: vec!["name".to_string(), "a/#".to_string()],
    }));
}

// ============================================================================
// PING / DISCONNECT
// ============================================================================

#[test]
fn ping_and_disconnect_round_trips() {
    round_trip(Packet::PingReq);
    round_trip(Packet::PingResp);
    round_trip(Packet::Disconnect);
}

#[test]
fn disconnect_rejects_payload() {
    let buf = [0xE0, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// Streaming behavior
// ============================================================================

#[test]
fn decoder_waits_for_complete_packet() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "partial/topic".into(),
        packet_id: Some(5),
        payload: Bytes::from_static(b"payload"),
    }));

    let decoder = Decoder::new();
    for cut in 0..encoded.len() {
        assert!(
            decoder.decode(&encoded[..cut]).unwrap().is_none(),
            "prefix of {} bytes must not decode",
            cut
        );
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn decoder_consumes_one_packet_from_pipelined_input() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_packet(&Packet::PingReq));
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck::new(2))));

    let decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck::new(2)));
}

#[test]
fn decoder_enforces_max_packet_size() {
    let decoder = Decoder::new().with_max_packet_size(16);
    let encoded = encode_packet(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "big/topic".into(),
        packet_id: None,
        payload: Bytes::from(vec![0u8; 64]),
    }));
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn decoder_rejects_unknown_packet_type() {
    let buf = [0x00, 0x00];
    let decoder = Decoder::new();
    assert_eq!(decoder.decode(&buf), Err(DecodeError::InvalidPacketType(0)));
}
