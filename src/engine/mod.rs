//! Boundary with the embedded network engine
//!
//! The engine is an external module with its own linear memory. Everything the
//! stack passes to it (addresses, frames) is copied into that memory first, and
//! everything it hands back is copied out. The traits here describe both call
//! directions:
//! - [`Engine`] / [`ForeignMemory`]: what the stack calls on the engine
//! - [`EngineCallbacks`]: what the engine calls on the stack

pub mod memory;
#[cfg(feature = "wasm")]
pub mod wasm;

use std::fmt;
use std::rc::Rc;

use crate::error::EngineError;

pub use memory::{copy_from_memory, view_from_memory, MemoryScope};

/// Status returned by the engine when a frame was accepted
pub const STATUS_OK: i32 = 0;

/// Opaque interface identifier issued by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceHandle(u32);

impl InterfaceHandle {
    pub const fn new(raw: u32) -> Self {
        InterfaceHandle(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Offset into the engine's linear memory. Never null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignPtr(u32);

impl ForeignPtr {
    /// `None` for the null pointer, which the engine uses for "unset"
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(ForeignPtr(raw))
        }
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Raw value of an optional pointer, null for `None`
    pub fn raw_or_null(ptr: Option<ForeignPtr>) -> u32 {
        ptr.map_or(0, ForeignPtr::get)
    }

    #[cfg(any(test, feature = "wasm"))]
    pub(crate) fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ForeignPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The engine's linear memory and allocator
pub trait ForeignMemory {
    fn alloc(&mut self, len: usize) -> Result<ForeignPtr, EngineError>;

    fn free(&mut self, ptr: ForeignPtr) -> Result<(), EngineError>;

    fn write(&mut self, ptr: ForeignPtr, bytes: &[u8]) -> Result<(), EngineError>;

    /// Borrow `len` bytes at `ptr`. The view cannot outlive the borrow of the memory.
    fn view(&self, ptr: ForeignPtr, len: usize) -> Result<&[u8], EngineError>;
}

/// Operations the stack invokes on the engine
///
/// Implementations are not reentrant: while one of these methods runs, the
/// engine may call [`EngineCallbacks`] but the stack never calls back into it.
pub trait Engine: ForeignMemory {
    /// Install the callbacks the engine uses to reach the stack
    fn attach(&mut self, callbacks: Rc<dyn EngineCallbacks>);

    /// Create an interface. The engine is expected to call
    /// [`EngineCallbacks::register_interface`] for the returned handle before returning.
    fn create_interface(
        &mut self,
        mac: ForeignPtr,
        ip: Option<ForeignPtr>,
        netmask: Option<ForeignPtr>,
    ) -> Result<InterfaceHandle, EngineError>;

    fn remove_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError>;

    /// Hand a frame to the engine; returns the engine status code
    fn send_frame(
        &mut self,
        handle: InterfaceHandle,
        frame: ForeignPtr,
        len: usize,
    ) -> Result<i32, EngineError>;

    fn enable_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError>;

    fn disable_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError>;

    /// Pointer to the interface's six MAC bytes, owned by the engine
    fn mac_address(&mut self, handle: InterfaceHandle) -> Result<ForeignPtr, EngineError>;

    /// Pointer to four address bytes, or `None` when unset
    fn ipv4_address(&mut self, handle: InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError>;

    /// Pointer to four netmask bytes, or `None` when unset
    fn ipv4_netmask(&mut self, handle: InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError>;
}

/// Calls the engine makes into the stack
pub trait EngineCallbacks {
    /// A new interface exists on the engine side
    fn register_interface(&self, handle: InterfaceHandle);

    /// A frame left the engine through `handle`. `frame` is a view into engine
    /// memory that is only valid for the duration of this call.
    fn deliver_frame(&self, handle: InterfaceHandle, frame: &[u8]);
}
