use std::net::Ipv4Addr;

use proptest::prelude::*;
use tap_bridge::network::ipv4::protocol;
use tap_bridge::network::{
    generate_netmask, get_prefix_length, parse_ipv4_address, parse_ipv4_packet,
    serialize_ipv4_address, serialize_ipv4_cidr, serialize_ipv4_packet, Ipv4Payload,
};
use tap_bridge::{CodecError, Ipv4Packet, MacAddress, UdpDatagram};

/// 192.168.1.1:8 -> 192.168.1.2:7, payload 01 02 03 04, checksums filled in
const UDP_VECTOR: [u8; 32] = [
    0x45, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0xf7, 0x79, 192, 168, 1, 1, 192,
    168, 1, 2, 0x00, 0x08, 0x00, 0x07, 0x00, 0x0c, 0x78, 0x6d, 0x01, 0x02, 0x03, 0x04,
];

#[test]
fn known_udp_packet() {
    let packet = Ipv4Packet::udp(
        Ipv4Addr::new(192, 168, 1, 1),
        Ipv4Addr::new(192, 168, 1, 2),
        8,
        7,
        &[1, 2, 3, 4],
    )
    .unwrap();
    assert_eq!(packet.checksum, 0xf779);
    assert_eq!(packet.total_length, 32);

    let bytes = serialize_ipv4_packet(&packet).unwrap();
    assert_eq!(bytes, UDP_VECTOR);

    let parsed = parse_ipv4_packet(&bytes).unwrap();
    assert_eq!(parsed, packet);
    match &parsed.payload {
        Ipv4Payload::Udp(datagram) => {
            assert_eq!(datagram.payload, vec![1, 2, 3, 4]);
            assert!(datagram.verify_checksum(parsed.source, parsed.destination));
        }
        other => panic!("expected UDP payload, got {other:?}"),
    }
}

#[test]
fn cidr_text_yields_address_and_netmask() {
    let cidr = serialize_ipv4_cidr("192.168.1.1/24").unwrap();
    assert_eq!(cidr.address().octets(), [192, 168, 1, 1]);
    assert_eq!(cidr.netmask().octets(), [255, 255, 255, 0]);
    assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 200)));
    assert!(!cidr.contains(Ipv4Addr::new(192, 168, 2, 1)));

    assert_eq!(serialize_ipv4_cidr("0.0.0.0/0").unwrap().netmask(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(
        serialize_ipv4_cidr("1.2.3.4/32").unwrap().netmask(),
        Ipv4Addr::BROADCAST
    );
    assert!(matches!(
        serialize_ipv4_cidr("1.2.3.4/x"),
        Err(CodecError::MalformedInput(_))
    ));
}

#[test]
fn netmask_edges() {
    assert_eq!(generate_netmask(0), Ok([0, 0, 0, 0]));
    assert_eq!(generate_netmask(32), Ok([255; 4]));
    assert_eq!(generate_netmask(33), Err(CodecError::PrefixOutOfRange(33)));
    assert_eq!(get_prefix_length(&[255, 255, 255, 0]), Ok(24));
    assert_eq!(get_prefix_length(&[255, 0, 255, 0]), Err(CodecError::NonContiguousBits));
    assert_eq!(
        get_prefix_length(&[255, 255]),
        Err(CodecError::InvalidLength {
            expected: 4,
            actual: 2
        })
    );
}

#[test]
fn oversized_payloads_are_refused_not_wrapped() {
    let mut packet = Ipv4Packet::udp(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, &[]).unwrap();
    packet.protocol = protocol::TCP;

    packet.payload = Ipv4Payload::Raw(vec![0; 65_515]);
    let bytes = serialize_ipv4_packet(&packet).unwrap();
    assert_eq!(bytes.len(), 65_535);
    assert_eq!(parse_ipv4_packet(&bytes).unwrap().total_length, 65_535);

    packet.payload = Ipv4Payload::Raw(vec![0; 65_516]);
    assert_eq!(
        serialize_ipv4_packet(&packet),
        Err(CodecError::PayloadTooLarge {
            max: 65_515,
            actual: 65_516
        })
    );

    assert!(matches!(
        UdpDatagram::new(1, 2, vec![0; 65_530]),
        Err(CodecError::PayloadTooLarge { max: 65_527, actual: 65_530 })
    ));
}

proptest! {
    #[test]
    fn address_text_round_trips(octets in any::<[u8; 4]>()) {
        let text = parse_ipv4_address(&octets).unwrap();
        prop_assert_eq!(text.clone(), Ipv4Addr::from(octets).to_string());
        prop_assert_eq!(serialize_ipv4_address(&text).unwrap(), octets);
    }

    #[test]
    fn prefix_length_inverts_netmask(prefix in 0u32..=32) {
        let mask = generate_netmask(prefix).unwrap();
        prop_assert_eq!(u32::from(get_prefix_length(&mask).unwrap()), prefix);
    }

    #[test]
    fn only_contiguous_masks_have_a_prefix(bits in any::<u32>()) {
        let contiguous = bits == u32::MAX.checked_shl(32 - bits.leading_ones()).unwrap_or(0);
        let result = get_prefix_length(&bits.to_be_bytes());
        if contiguous {
            prop_assert_eq!(result, Ok(bits.leading_ones() as u8));
        } else {
            prop_assert_eq!(result, Err(CodecError::NonContiguousBits));
        }
    }

    #[test]
    fn mac_text_round_trips(octets in any::<[u8; 6]>()) {
        let mac = MacAddress::from(octets);
        let text = mac.to_string();
        prop_assert_eq!(text.len(), 17);
        prop_assert_eq!(text.parse::<MacAddress>().unwrap(), mac);
    }

    #[test]
    fn udp_packets_survive_the_wire(
        source in any::<[u8; 4]>(),
        destination in any::<[u8; 4]>(),
        ports in any::<(u16, u16)>(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let packet =
            Ipv4Packet::udp(source.into(), destination.into(), ports.0, ports.1, &payload).unwrap();
        let bytes = serialize_ipv4_packet(&packet).unwrap();
        prop_assert_eq!(bytes.len(), 28 + payload.len());
        prop_assert_eq!(parse_ipv4_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn raw_payloads_are_kept_verbatim(
        payload in proptest::collection::vec(any::<u8>(), 0..128),
        ttl in any::<u8>(),
        identification in any::<u16>(),
    ) {
        let mut packet = Ipv4Packet::udp(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, &[]).unwrap();
        packet.protocol = protocol::TCP;
        packet.ttl = ttl;
        packet.identification = identification;
        packet.payload = Ipv4Payload::Raw(payload.clone());

        let parsed = parse_ipv4_packet(&serialize_ipv4_packet(&packet).unwrap()).unwrap();
        prop_assert_eq!(parsed.payload, Ipv4Payload::Raw(payload));
        prop_assert_eq!(parsed.ttl, ttl);
        prop_assert_eq!(parsed.identification, identification);
    }

    #[test]
    fn corrupted_headers_are_rejected(byte in 0usize..20, bit in 0u8..8) {
        let mut bytes = UDP_VECTOR;
        bytes[byte] ^= 1 << bit;
        prop_assert!(parse_ipv4_packet(&bytes).is_err());
    }
}
