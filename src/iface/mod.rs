//! Virtual interfaces and their binding to the engine
//!
//! - [`TapStack`]: owns the engine and creates/removes interfaces
//! - [`TapInterface`]: one interface as a frame source and frame sink
//! - [`HostTap`]: optional bridge to a kernel TAP device (`host-tap` feature)

#[cfg(feature = "host-tap")]
pub mod host;
pub mod interface;
mod registry;
pub mod stack;

// Re-export commonly used items
#[cfg(feature = "host-tap")]
pub use host::HostTap;
pub use interface::{Frame, FrameReader, FrameWriter, InterfaceStats, TapInterface};
pub use stack::{Dispatcher, TapStack};
