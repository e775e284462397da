//! MQTT 3.1.1 packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, SubscribeTopic, UnsubAck, Unsubscribe,
    Will, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// Streaming MQTT packet decoder
pub struct Decoder {
    /// Maximum accepted remaining length
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of `buf`.
    /// Returns `Ok(None)` when the buffer holds an incomplete packet,
    /// otherwise `(packet, bytes_consumed)`.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(flags, body)?,
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(PubAck::new(decode_ack(flags, 0, body)?)),
            5 => Packet::PubRec(PubRec::new(decode_ack(flags, 0, body)?)),
            6 => Packet::PubRel(PubRel::new(decode_ack(flags, 0x02, body)?)),
            7 => Packet::PubComp(PubComp::new(decode_ack(flags, 0, body)?)),
            8 => decode_subscribe(flags, body)?,
            9 => decode_suback(flags, body)?,
            10 => decode_unsubscribe(flags, body)?,
            11 => {
                let packet_id = decode_ack(flags, 0, body)?;
                Packet::UnsubAck(UnsubAck { packet_id })
            }
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("PINGREQ has no payload"));
                }
                Packet::PingReq
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("PINGRESP has no payload"));
                }
                Packet::PingResp
            }
            14 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("DISCONNECT has no payload"));
                }
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;

    let (protocol_name, len) = read_string(&body[pos..])?;
    pos += len;
    if protocol_name != PROTOCOL_NAME {
        return Err(DecodeError::InvalidProtocolName);
    }

    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let level = body[pos];
    pos += 1;
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolLevel(level));
    }

    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = body[pos];
    pos += 1;

    // [MQTT-3.1.2-3] reserved bit must be zero
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22] password requires username
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }

    // [MQTT-3.1.2-11] will QoS/retain must be zero without the will flag
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    if pos + 2 > body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([body[pos], body[pos + 1]]);
    pos += 2;

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let will = if will_flag {
        let (will_topic, len) = read_string(&body[pos..])?;
        pos += len;

        if will_topic.is_empty() {
            return Err(DecodeError::InvalidTopic("will topic cannot be empty"));
        }
        if will_topic.contains('+') || will_topic.contains('#') {
            return Err(DecodeError::InvalidTopic("will topic contains wildcard"));
        }

        let (will_payload, len) = read_binary(&body[pos..])?;
        pos += len;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            // Validated above
            qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, len) = read_binary(&body[pos..])?;
        pos += len;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    if pos != body.len() {
        return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
    }

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK length must be 2"));
    }

    // Only bit 0 (session present) may be set
    if (body[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let session_present = (body[0] & 0x01) != 0;

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    // [MQTT-3.2.2-4] a refused connect never reports a present session
    if session_present && !return_code.is_accepted() {
        return Err(DecodeError::MalformedPacket(
            "session present with non-zero return code",
        ));
    }

    Ok(Packet::ConnAck(ConnAck {
        session_present,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    let (topic, len) = read_string(&body[pos..])?;
    pos += len;

    if topic.is_empty() {
        return Err(DecodeError::InvalidTopic("topic name cannot be empty"));
    }
    // [MQTT-3.3.2-2] no wildcards in a topic name
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::InvalidTopic("topic name contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(&body[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload,
    }))
}

/// Decode the shared PUBACK/PUBREC/PUBREL/PUBCOMP/UNSUBACK body:
/// fixed flags plus a two-byte packet identifier.
fn decode_ack(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("ack length must be 2"));
    }
    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(packet_id)
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // [MQTT-3.8.1-1] SUBSCRIBE flags must be 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    let mut pos = 2;

    let mut topics = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::InvalidTopic("topic filter cannot be empty"));
        }

        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = body[pos];
        pos += 1;

        // [MQTT-3.8.3-4] upper bits of the requested QoS byte are reserved
        if (qos_byte & 0xFC) != 0 {
            return Err(DecodeError::MalformedPacket("reserved bits in requested QoS"));
        }
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        topics.push(SubscribeTopic {
            filter: filter.to_string(),
            qos,
        });
    }

    // [MQTT-3.8.3-3] at least one filter
    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must carry at least one topic filter",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([body[0], body[1]]);

    let mut return_codes = Vec::with_capacity(body.len() - 2);
    for &code in &body[2..] {
        return_codes.push(
            SubscribeReturnCode::from_u8(code)
                .ok_or(DecodeError::MalformedPacket("invalid SUBACK return code"))?,
        );
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // [MQTT-3.10.1-1] UNSUBSCRIBE flags must be 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    let mut pos = 2;

    let mut filters = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::InvalidTopic("topic filter cannot be empty"));
        }

        filters.push(filter.to_string());
    }

    // [MQTT-3.10.3-2] at least one filter
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must carry at least one topic filter",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
