//! Property tests
//!
//! Generated coverage for the codec (round-trips, remaining-length
//! bijection, strict string validation), topic matching laws and the
//! packet-id allocator.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use relaymq::codec::{
    read_variable_int, valid_mqtt_string, variable_int_len, write_variable_int, Decoder, Encoder,
};
use relaymq::protocol::{
    Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, SubscribeTopic, UnsubAck,
    Unsubscribe,
};
use relaymq::session::{Session, SessionLimits};
use relaymq::topic::topic_matches_filter;

fn round_trip(packet: &Packet) -> Packet {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    let (decoded, consumed) = Decoder::new().decode(&buf).unwrap().unwrap();
    assert_eq!(consumed, buf.len());
    decoded
}

fn qos_strategy() -> impl Strategy<Value = QoS> {
    prop_oneof![
        Just(QoS::AtMostOnce),
        Just(QoS::AtLeastOnce),
        Just(QoS::ExactlyOnce),
    ]
}

fn topic_name_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,6}(/[a-z0-9]{1,6}){0,3}"
}

fn topic_filter_strategy() -> impl Strategy<Value = String> {
    // Literal levels, possibly with + levels and a trailing #
    (
        proptest::collection::vec(
            prop_oneof![3 => "[a-z]{1,5}", 1 => Just("+".to_string())],
            1..4,
        ),
        proptest::bool::ANY,
    )
        .prop_map(|(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            }
            levels.join("/")
        })
}

proptest! {
    #[test]
    fn remaining_length_bijection(n in 0u32..=268_435_455) {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, n).unwrap();
        prop_assert_eq!(written, variable_int_len(n));
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        prop_assert_eq!(decoded, n);
        prop_assert_eq!(consumed, written);
    }

    #[test]
    fn publish_round_trips(
        topic in topic_name_strategy(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        qos in qos_strategy(),
        packet_id in 1u16..,
        dup in any::<bool>(),
        retain in any::<bool>(),
    ) {
        let packet = Packet::Publish(Publish {
            dup: dup && qos != QoS::AtMostOnce,
            qos,
            retain,
            topic: topic.as_str().into(),
            packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
            payload: Bytes::from(payload),
        });
        prop_assert_eq!(round_trip(&packet), packet);
    }

    #[test]
    fn subscribe_round_trips(
        packet_id in 1u16..,
        filters in proptest::collection::vec(
            (topic_filter_strategy(), qos_strategy()),
            1..5,
        ),
    ) {
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            topics: filters
                .into_iter()
                .map(|(filter, qos)| SubscribeTopic { filter, qos })
                .collect(),
        });
        prop_assert_eq!(round_trip(&packet), packet);

        let unsub = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec!["a/b".to_string()],
        });
        prop_assert_eq!(round_trip(&unsub), unsub);
    }

    #[test]
    fn ack_round_trips(packet_id in 1u16..) {
        for packet in [
            Packet::PubAck(PubAck::new(packet_id)),
            Packet::PubRec(PubRec::new(packet_id)),
            Packet::PubRel(PubRel::new(packet_id)),
            Packet::PubComp(PubComp::new(packet_id)),
            Packet::UnsubAck(UnsubAck { packet_id }),
        ] {
            prop_assert_eq!(round_trip(&packet), packet);
        }
    }

    #[test]
    fn control_characters_invalidate_strings(
        prefix in "[a-z]{0,8}",
        suffix in "[a-z]{0,8}",
        forbidden in prop_oneof![
            (0x00u32..=0x1F),
            (0x7Fu32..=0x9F),
            Just(0xFEFFu32),
        ],
    ) {
        let c = char::from_u32(forbidden).unwrap();
        let s = format!("{}{}{}", prefix, c, suffix);
        prop_assert!(!valid_mqtt_string(&s));
    }

    #[test]
    fn plain_strings_are_valid(s in "[a-zA-Z0-9 /+#._-]{0,32}") {
        prop_assert!(valid_mqtt_string(&s));
    }

    #[test]
    fn hash_matches_everything_except_system_topics(topic in topic_name_strategy()) {
        prop_assert!(topic_matches_filter(&topic, "#"));
        let system = format!("${}", topic);
        prop_assert!(!topic_matches_filter(&system, "#"));
        prop_assert!(!topic_matches_filter(&system, "+"));
    }

    #[test]
    fn plus_matches_exactly_one_level(topic in topic_name_strategy()) {
        let levels = topic.split('/').count();
        let all_plus = vec!["+"; levels].join("/");
        prop_assert!(topic_matches_filter(&topic, &all_plus));

        let too_many = vec!["+"; levels + 1].join("/");
        prop_assert!(!topic_matches_filter(&topic, &too_many));
    }

    #[test]
    fn exact_filter_matches_itself(topic in topic_name_strategy()) {
        prop_assert!(topic_matches_filter(&topic, &topic));
    }

    #[test]
    fn packet_ids_unique_while_in_flight(count in 1usize..200) {
        let mut session = Session::new("prop".into(), true, SessionLimits::default());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..count {
            let pid = session.next_packet_id().unwrap();
            prop_assert!(pid != 0);
            prop_assert!(seen.insert(pid));
            session.insert_in_flight(pid, Publish {
                qos: QoS::AtLeastOnce,
                topic: "t".into(),
                packet_id: Some(pid),
                ..Default::default()
            });
        }
    }
}
