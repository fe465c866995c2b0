//! Network layer wire formats
//!
//! This module contains the link and network layer codecs:
//! - MAC: Ethernet hardware addresses
//! - IPv4: addresses, CIDR notation, netmasks and packet headers

pub mod ipv4;
pub mod mac;

// Re-export commonly used items
pub use ipv4::{
    generate_netmask, get_prefix_length, parse_ipv4_address, parse_ipv4_packet,
    serialize_ipv4_address, serialize_ipv4_cidr, serialize_ipv4_packet, Ipv4Cidr, Ipv4Packet,
    Ipv4Payload,
};
pub use mac::{generate_mac_address, parse_mac_address, serialize_mac_address, MacAddress};

/// RFC 1071 Internet checksum over big-endian 16-bit words
///
/// Shared by the IPv4 header and the UDP pseudo header. A buffer that already
/// carries a valid checksum sums to zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    for chunk in data.chunks_exact(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // Odd trailing byte is padded with zero
    if let [.., last] = data {
        if data.len() % 2 != 0 {
            sum += (*last as u32) << 8;
        }
    }

    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
