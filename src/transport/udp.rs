//! UDP (User Datagram Protocol) datagrams
//!
//! This module provides UDP datagram parsing and serialization for the IPv4 codec.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;
use crate::network::checksum;
use crate::network::ipv4::protocol;

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// Largest payload the 16-bit length field can describe
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - UDP_HEADER_LEN;

/// A UDP datagram as defined in RFC 768
///
/// `length` holds the wire value after parsing and is recomputed by [`UdpDatagram::to_bytes`].
/// `checksum` is written as stored; zero means "no checksum".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// Create a datagram without a checksum
    pub fn new(
        source_port: u16,
        destination_port: u16,
        payload: Vec<u8>,
    ) -> Result<Self, CodecError> {
        Ok(UdpDatagram {
            source_port,
            destination_port,
            length: wire_length(payload.len())?,
            checksum: 0,
            payload,
        })
    }

    /// Parse a UDP datagram from the IPv4 payload
    ///
    /// Bytes past the UDP length field are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(CodecError::Truncated {
                what: "UDP header",
                needed: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }

        let length = BigEndian::read_u16(&data[4..6]);
        let len = usize::from(length);
        if len < UDP_HEADER_LEN {
            return Err(CodecError::malformed(format!(
                "UDP length {len} is shorter than its header"
            )));
        }
        if len > data.len() {
            return Err(CodecError::Truncated {
                what: "UDP datagram",
                needed: len,
                actual: data.len(),
            });
        }

        Ok(UdpDatagram {
            source_port: BigEndian::read_u16(&data[0..2]),
            destination_port: BigEndian::read_u16(&data[2..4]),
            length,
            checksum: BigEndian::read_u16(&data[6..8]),
            payload: data[UDP_HEADER_LEN..len].to_vec(),
        })
    }

    /// Convert the datagram to bytes
    ///
    /// Fails when the payload is too long for the length field.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let length = wire_length(self.payload.len())?;
        let mut bytes = vec![0u8; usize::from(length)];
        BigEndian::write_u16(&mut bytes[0..2], self.source_port);
        BigEndian::write_u16(&mut bytes[2..4], self.destination_port);
        BigEndian::write_u16(&mut bytes[4..6], length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes[UDP_HEADER_LEN..].copy_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Calculate the UDP checksum over the IPv4 pseudo header
    pub fn compute_checksum(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Result<u16, CodecError> {
        let mut datagram = self.to_bytes()?;
        datagram[6] = 0;
        datagram[7] = 0;
        let sum = pseudo_header_checksum(source, destination, &datagram);
        // An all-zero result is transmitted as all ones
        Ok(if sum == 0 { 0xFFFF } else { sum })
    }

    /// Check the stored checksum; a zero checksum is always accepted
    ///
    /// A datagram too long to encode never verifies.
    pub fn verify_checksum(&self, source: Ipv4Addr, destination: Ipv4Addr) -> bool {
        if self.checksum == 0 {
            return true;
        }
        self.to_bytes()
            .map_or(false, |datagram| pseudo_header_checksum(source, destination, &datagram) == 0)
    }
}

fn wire_length(payload_len: usize) -> Result<u16, CodecError> {
    UDP_HEADER_LEN
        .checked_add(payload_len)
        .and_then(|len| u16::try_from(len).ok())
        .ok_or(CodecError::PayloadTooLarge {
            max: MAX_UDP_PAYLOAD,
            actual: payload_len,
        })
}

/// `datagram` comes from [`UdpDatagram::to_bytes`], so its length fits in 16 bits
fn pseudo_header_checksum(source: Ipv4Addr, destination: Ipv4Addr, datagram: &[u8]) -> u16 {
    // src_ip(4) + dst_ip(4) + zero(1) + protocol(1) + udp_len(2) = 12 bytes
    let mut pseudo = Vec::with_capacity(12 + datagram.len());
    pseudo.extend_from_slice(&source.octets());
    pseudo.extend_from_slice(&destination.octets());
    pseudo.push(0);
    pseudo.push(protocol::UDP);
    // Reuse the length field the datagram already carries
    pseudo.extend_from_slice(&datagram[4..6]);
    pseudo.extend_from_slice(datagram);
    checksum(&pseudo)
}
