//! Transport layer wire formats
//!
//! The engine owns every transport state machine; this module only decodes
//! what the IPv4 codec dispatches to it:
//! - UDP: User Datagram Protocol

pub mod udp;

// Re-export commonly used items
pub use udp::{UdpDatagram, UDP_HEADER_LEN};
