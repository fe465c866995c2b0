//! Copying bytes in and out of engine memory
//!
//! Allocations are tied to a [`MemoryScope`]; dropping the scope frees them, so
//! every exit path of an operation (including `?`) releases what it allocated.

use tracing::warn;

use super::{ForeignMemory, ForeignPtr};
use crate::error::EngineError;

/// Arena of foreign allocations for a single operation
pub struct MemoryScope<'m, M: ForeignMemory + ?Sized> {
    memory: &'m mut M,
    allocations: Vec<ForeignPtr>,
}

impl<'m, M: ForeignMemory + ?Sized> MemoryScope<'m, M> {
    pub fn new(memory: &'m mut M) -> Self {
        MemoryScope {
            memory,
            allocations: Vec::new(),
        }
    }

    /// Allocate engine memory and copy `bytes` into it
    pub fn copy_to_memory(&mut self, bytes: &[u8]) -> Result<ForeignPtr, EngineError> {
        // Zero-sized allocations may legitimately return null
        let ptr = self.memory.alloc(bytes.len().max(1))?;
        self.allocations.push(ptr);
        self.memory.write(ptr, bytes)?;
        Ok(ptr)
    }

    /// The memory (usually the engine itself) for the call consuming the pointers
    pub fn memory(&mut self) -> &mut M {
        &mut *self.memory
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

impl<M: ForeignMemory + ?Sized> Drop for MemoryScope<'_, M> {
    fn drop(&mut self) {
        while let Some(ptr) = self.allocations.pop() {
            if let Err(err) = self.memory.free(ptr) {
                warn!(%ptr, error = %err, "failed to release engine allocation");
            }
        }
    }
}

/// Snapshot `len` bytes of engine memory
pub fn copy_from_memory<M: ForeignMemory + ?Sized>(
    memory: &M,
    ptr: ForeignPtr,
    len: usize,
) -> Result<Vec<u8>, EngineError> {
    Ok(memory.view(ptr, len)?.to_vec())
}

/// Read-only view into engine memory, valid while `memory` is borrowed
pub fn view_from_memory<M: ForeignMemory + ?Sized>(
    memory: &M,
    ptr: ForeignPtr,
    len: usize,
) -> Result<&[u8], EngineError> {
    memory.view(ptr, len)
}
