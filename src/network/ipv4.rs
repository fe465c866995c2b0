//! IPv4 wire formats
//!
//! This module provides the IPv4 pieces the engine boundary needs:
//! - Dotted-decimal address parsing and serialization
//! - CIDR notation and netmask/prefix conversion
//! - IPv4 packet parsing and serialization with header checksum
//!
//! Serialization always recomputes derived fields (header length, total length,
//! header checksum) and fails when the payload does not fit the total length
//! field. Parsing verifies the header checksum and rejects packets whose
//! checksum does not match.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;
use crate::network::checksum;
use crate::transport::udp::UdpDatagram;

/// Length of an IPv4 address in bytes
pub const IPV4_ADDR_LEN: usize = 4;

const IPV4_HEADER_LEN: usize = 20;

/// Largest payload the 16-bit total length field leaves room for
pub const MAX_IPV4_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)
const DEFAULT_TTL: u8 = 64;
const MAX_PREFIX_LEN: u32 = 32;

/// IPv4 protocol numbers
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 flags (3-bit field preceding the fragment offset)
pub mod flags {
    pub const DONT_FRAGMENT: u8 = 0b010;
    pub const MORE_FRAGMENTS: u8 = 0b001;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

/// Copy exactly four bytes out of `bytes`
pub fn ipv4_octets(bytes: &[u8]) -> Result<[u8; IPV4_ADDR_LEN], CodecError> {
    bytes.try_into().map_err(|_| CodecError::InvalidLength {
        expected: IPV4_ADDR_LEN,
        actual: bytes.len(),
    })
}

/// Decode four bytes into dotted-decimal notation
pub fn parse_ipv4_address(bytes: &[u8]) -> Result<String, CodecError> {
    let [a, b, c, d] = ipv4_octets(bytes)?;
    Ok(format!("{a}.{b}.{c}.{d}"))
}

/// Encode a dotted-decimal address
///
/// Exactly four fields are required, each a canonical decimal integer in 0..=255.
pub fn serialize_ipv4_address(address: &str) -> Result<[u8; IPV4_ADDR_LEN], CodecError> {
    let mut octets = [0u8; IPV4_ADDR_LEN];
    let mut fields = address.split('.');
    for octet in octets.iter_mut() {
        let field = fields.next().ok_or_else(|| {
            CodecError::malformed(format!("IPv4 address `{address}` has too few fields"))
        })?;
        *octet = parse_octet(address, field)?;
    }
    if fields.next().is_some() {
        return Err(CodecError::malformed(format!(
            "IPv4 address `{address}` has too many fields"
        )));
    }
    Ok(octets)
}

fn parse_octet(address: &str, field: &str) -> Result<u8, CodecError> {
    let digits_only = !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit());
    if !digits_only {
        return Err(CodecError::malformed(format!(
            "IPv4 address `{address}` has non-numeric field `{field}`"
        )));
    }
    if field.len() > 1 && field.starts_with('0') {
        return Err(CodecError::malformed(format!(
            "IPv4 address `{address}` has leading zero in `{field}`"
        )));
    }
    // At most three digits keeps the parse below clear of overflow
    if field.len() > 3 {
        return Err(CodecError::malformed(format!(
            "IPv4 address `{address}` field `{field}` is out of range"
        )));
    }
    let value: u16 = field
        .parse()
        .map_err(|_| CodecError::malformed(format!("IPv4 address `{address}` has invalid field `{field}`")))?;
    u8::try_from(value).map_err(|_| {
        CodecError::malformed(format!(
            "IPv4 address `{address}` field `{field}` is out of range"
        ))
    })
}

/// Netmask with `prefix_len` leading one bits
pub fn generate_netmask(prefix_len: u32) -> Result<[u8; IPV4_ADDR_LEN], CodecError> {
    if prefix_len > MAX_PREFIX_LEN {
        return Err(CodecError::PrefixOutOfRange(prefix_len));
    }
    let bits = u32::MAX.checked_shl(MAX_PREFIX_LEN - prefix_len).unwrap_or(0);
    Ok(bits.to_be_bytes())
}

/// Count the leading one bits of a netmask
///
/// Fails with [`CodecError::NonContiguousBits`] unless the mask is of the form `1^k 0^(32-k)`.
pub fn get_prefix_length(netmask: &[u8]) -> Result<u8, CodecError> {
    let bits = u32::from_be_bytes(ipv4_octets(netmask)?);
    let prefix_len = bits.leading_ones();
    // Everything after the leading ones must be zero
    if bits.checked_shl(prefix_len).unwrap_or(0) != 0 {
        return Err(CodecError::NonContiguousBits);
    }
    Ok(prefix_len as u8)
}

/// An IPv4 address together with its prefix length (`a.b.c.d/n`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, CodecError> {
        if u32::from(prefix_len) > MAX_PREFIX_LEN {
            return Err(CodecError::PrefixOutOfRange(prefix_len.into()));
        }
        Ok(Ipv4Cidr {
            address,
            prefix_len,
        })
    }

    /// Build from an address and a netmask, validating the mask shape
    pub fn from_netmask(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, CodecError> {
        let prefix_len = get_prefix_length(&netmask.octets())?;
        Ok(Ipv4Cidr {
            address,
            prefix_len,
        })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        // prefix_len is validated on construction
        let bits = u32::MAX
            .checked_shl(MAX_PREFIX_LEN - u32::from(self.prefix_len))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    /// Network address (host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask()))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask()) == u32::from(self.network())
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serialize_ipv4_cidr(s)
    }
}

/// Split `a.b.c.d/n` into address bytes and a generated netmask
pub fn serialize_ipv4_cidr(cidr: &str) -> Result<Ipv4Cidr, CodecError> {
    let (address, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| CodecError::malformed(format!("CIDR `{cidr}` is missing a prefix length")))?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::malformed(format!(
            "CIDR `{cidr}` has invalid prefix length `{prefix}`"
        )));
    }
    let prefix_len: u32 = prefix
        .parse()
        .map_err(|_| CodecError::PrefixOutOfRange(u32::MAX))?;
    if prefix_len > MAX_PREFIX_LEN {
        return Err(CodecError::PrefixOutOfRange(prefix_len));
    }
    let address = Ipv4Addr::from(serialize_ipv4_address(address)?);
    Ipv4Cidr::new(address, prefix_len as u8)
}

/// Payload of an IPv4 packet, dispatched on the protocol number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv4Payload {
    Udp(UdpDatagram),
    /// Any protocol this codec does not decode
    Raw(Vec<u8>),
}

impl Ipv4Payload {
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Ipv4Payload::Udp(datagram) => datagram.to_bytes(),
            Ipv4Payload::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

/// An IPv4 packet with its fixed header fields
///
/// `total_length` and `checksum` hold the wire values after parsing; they are
/// recomputed on serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: Ipv4Payload,
}

impl Ipv4Packet {
    /// Build a UDP packet with default header values and a filled-in UDP checksum
    pub fn udp(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        source_port: u16,
        destination_port: u16,
        payload: &[u8],
    ) -> Result<Self, CodecError> {
        let mut datagram = UdpDatagram::new(source_port, destination_port, payload.to_vec())?;
        datagram.checksum = datagram.compute_checksum(source, destination)?;
        let mut packet = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol: protocol::UDP,
            checksum: 0,
            source,
            destination,
            payload: Ipv4Payload::Udp(datagram),
        };
        let header = packet.header_bytes(packet.payload.to_bytes()?.len())?;
        packet.total_length = BigEndian::read_u16(&header[2..4]);
        packet.checksum = BigEndian::read_u16(&header[10..12]);
        Ok(packet)
    }

    /// Header bytes for a payload of `payload_len` bytes, checksum included
    fn header_bytes(&self, payload_len: usize) -> Result<[u8; IPV4_HEADER_LEN], CodecError> {
        let total_length = IPV4_HEADER_LEN
            .checked_add(payload_len)
            .and_then(|len| u16::try_from(len).ok())
            .ok_or(CodecError::PayloadTooLarge {
                max: MAX_IPV4_PAYLOAD,
                actual: payload_len,
            })?;
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        bytes[0] = (IPV4_VERSION << 4) | DEFAULT_IHL;
        bytes[1] = (self.dscp << 2) | (self.ecn & 0x03);
        BigEndian::write_u16(&mut bytes[2..4], total_length);
        BigEndian::write_u16(&mut bytes[4..6], self.identification);
        BigEndian::write_u16(
            &mut bytes[6..8],
            (u16::from(self.flags & 0x07) << 13) | (self.fragment_offset & flags::FRAGMENT_OFFSET_MASK),
        );
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        // bytes[10..12] stays zero while the checksum is computed
        bytes[12..16].copy_from_slice(&self.source.octets());
        bytes[16..20].copy_from_slice(&self.destination.octets());
        let sum = checksum(&bytes);
        BigEndian::write_u16(&mut bytes[10..12], sum);
        Ok(bytes)
    }
}

/// Decode an IPv4 packet, verifying its header checksum
pub fn parse_ipv4_packet(data: &[u8]) -> Result<Ipv4Packet, CodecError> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(CodecError::Truncated {
            what: "IPv4 header",
            needed: IPV4_HEADER_LEN,
            actual: data.len(),
        });
    }

    let version = data[0] >> 4;
    if version != IPV4_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let header_len = usize::from(data[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(CodecError::malformed(format!(
            "IPv4 header length {header_len} is below the minimum"
        )));
    }
    if data.len() < header_len {
        return Err(CodecError::Truncated {
            what: "IPv4 options",
            needed: header_len,
            actual: data.len(),
        });
    }

    let total_length = BigEndian::read_u16(&data[2..4]);
    let total = usize::from(total_length);
    if total < header_len {
        return Err(CodecError::malformed(format!(
            "IPv4 total length {total} is shorter than its header"
        )));
    }
    if total > data.len() {
        return Err(CodecError::Truncated {
            what: "IPv4 packet",
            needed: total,
            actual: data.len(),
        });
    }

    let wire = BigEndian::read_u16(&data[10..12]);
    let mut header = data[..header_len].to_vec();
    header[10] = 0;
    header[11] = 0;
    let computed = checksum(&header);
    if computed != wire {
        return Err(CodecError::ChecksumMismatch { wire, computed });
    }

    let flags_fragment = BigEndian::read_u16(&data[6..8]);
    let protocol = data[9];
    let body = &data[header_len..total];
    let payload = match protocol {
        protocol::UDP => Ipv4Payload::Udp(UdpDatagram::parse(body)?),
        _ => Ipv4Payload::Raw(body.to_vec()),
    };

    Ok(Ipv4Packet {
        dscp: data[1] >> 2,
        ecn: data[1] & 0x03,
        total_length,
        identification: BigEndian::read_u16(&data[4..6]),
        flags: (flags_fragment >> 13) as u8,
        fragment_offset: flags_fragment & flags::FRAGMENT_OFFSET_MASK,
        ttl: data[8],
        protocol,
        checksum: wire,
        source: Ipv4Addr::from(ipv4_octets(&data[12..16])?),
        destination: Ipv4Addr::from(ipv4_octets(&data[16..20])?),
        payload,
    })
}

/// Encode an IPv4 packet, recomputing its length and checksum fields
///
/// Fails with [`CodecError::PayloadTooLarge`] rather than wrapping a length field.
pub fn serialize_ipv4_packet(packet: &Ipv4Packet) -> Result<Vec<u8>, CodecError> {
    let payload = packet.payload.to_bytes()?;
    let header = packet.header_bytes(payload.len())?;
    let mut bytes = Vec::with_capacity(IPV4_HEADER_LEN + payload.len());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}
