//! Virtual tap interfaces backed by an embedded network engine
//!
//! The engine (usually a WebAssembly module) implements the protocols. This
//! crate provides:
//! - Wire codecs for MAC, IPv4 and UDP
//! - Marshaling of values into and out of the engine's linear memory
//! - A binding that turns engine interfaces into frame sources and sinks

pub mod config;
pub mod engine;
pub mod error;
pub mod iface;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::{InterfaceOptions, StackConfig};
pub use engine::{Engine, EngineCallbacks, ForeignMemory, ForeignPtr, InterfaceHandle};
pub use error::{CodecError, EngineError, TapError};
pub use iface::{
    Dispatcher, Frame, FrameReader, FrameWriter, InterfaceStats, TapInterface, TapStack,
};
pub use network::{Ipv4Cidr, Ipv4Packet, MacAddress};
pub use transport::UdpDatagram;

#[cfg(feature = "wasm")]
pub use engine::wasm::WasmEngine;
#[cfg(feature = "host-tap")]
pub use iface::HostTap;
