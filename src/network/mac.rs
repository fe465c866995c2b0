//! Ethernet MAC addresses
//!
//! Engine-side MAC addresses are six raw bytes; consumers see them as the
//! usual colon-separated lowercase hex string.

use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

/// Length of a MAC address in bytes
pub const MAC_LEN: usize = 6;

const MULTICAST_BIT: u8 = 0x01;
const LOCAL_BIT: u8 = 0x02;

/// A 48-bit Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; MAC_LEN]);

impl MacAddress {
    pub const fn new(octets: [u8; MAC_LEN]) -> Self {
        MacAddress(octets)
    }

    pub const fn octets(&self) -> [u8; MAC_LEN] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT != 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & LOCAL_BIT != 0
    }

    /// Random locally administered unicast address
    pub fn generate() -> Self {
        let mut octets: [u8; MAC_LEN] = rand::random();
        octets[0] = (octets[0] & !MULTICAST_BIT) | LOCAL_BIT;
        MacAddress(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; MAC_LEN];
        let mut fields = s.split(':');
        for octet in octets.iter_mut() {
            let field = fields
                .next()
                .ok_or_else(|| CodecError::malformed(format!("MAC address `{s}` has too few fields")))?;
            if field.len() != 2 || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(CodecError::malformed(format!(
                    "MAC address `{s}` has invalid field `{field}`"
                )));
            }
            *octet = u8::from_str_radix(field, 16)
                .map_err(|_| CodecError::malformed(format!("MAC address `{s}` has invalid field `{field}`")))?;
        }
        if fields.next().is_some() {
            return Err(CodecError::malformed(format!(
                "MAC address `{s}` has too many fields"
            )));
        }
        Ok(MacAddress(octets))
    }
}

impl From<[u8; MAC_LEN]> for MacAddress {
    fn from(octets: [u8; MAC_LEN]) -> Self {
        MacAddress(octets)
    }
}

/// Decode a MAC address from exactly six bytes
pub fn parse_mac_address(bytes: &[u8]) -> Result<MacAddress, CodecError> {
    let octets: [u8; MAC_LEN] = bytes.try_into().map_err(|_| CodecError::InvalidLength {
        expected: MAC_LEN,
        actual: bytes.len(),
    })?;
    Ok(MacAddress(octets))
}

pub fn serialize_mac_address(mac: &MacAddress) -> [u8; MAC_LEN] {
    mac.0
}

pub fn generate_mac_address() -> MacAddress {
    MacAddress::generate()
}
