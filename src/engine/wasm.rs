//! [`Engine`] implementation for a WebAssembly network engine
//!
//! The module must export `memory`, `malloc`, `free`, `create_tap_interface`,
//! `remove_tap_interface`, `send_tap_interface`, `enable_tap_interface`,
//! `disable_tap_interface` and the `get_interface_*` accessors. It may import
//! `register_tap_interface` and `receive_frame` from the `env` module.

use std::path::Path;
use std::rc::Rc;

use tracing::{debug, warn};
use wasmtime::{Caller, Instance, Linker, Memory, Module, Store, TypedFunc, WasmParams, WasmResults};

use super::{Engine, EngineCallbacks, ForeignMemory, ForeignPtr, InterfaceHandle};
use crate::error::{EngineError, TapError};

/// Module the engine imports host callbacks from
pub const IMPORT_MODULE: &str = "env";

impl From<wasmtime::Error> for EngineError {
    fn from(err: wasmtime::Error) -> Self {
        EngineError::Trap(format!("{err:#}"))
    }
}

#[derive(Default)]
struct HostState {
    callbacks: Option<Rc<dyn EngineCallbacks>>,
}

struct Exports {
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    create_tap_interface: TypedFunc<(u32, u32, u32), u32>,
    remove_tap_interface: TypedFunc<u32, ()>,
    send_tap_interface: TypedFunc<(u32, u32, u32), i32>,
    enable_tap_interface: TypedFunc<u32, ()>,
    disable_tap_interface: TypedFunc<u32, ()>,
    get_interface_mac_address: TypedFunc<u32, u32>,
    get_interface_ip4_address: TypedFunc<u32, u32>,
    get_interface_ip4_netmask: TypedFunc<u32, u32>,
}

impl Exports {
    fn resolve(instance: &Instance, store: &mut Store<HostState>) -> Result<Self, EngineError> {
        Ok(Exports {
            malloc: typed(instance, store, "malloc")?,
            free: typed(instance, store, "free")?,
            create_tap_interface: typed(instance, store, "create_tap_interface")?,
            remove_tap_interface: typed(instance, store, "remove_tap_interface")?,
            send_tap_interface: typed(instance, store, "send_tap_interface")?,
            enable_tap_interface: typed(instance, store, "enable_tap_interface")?,
            disable_tap_interface: typed(instance, store, "disable_tap_interface")?,
            get_interface_mac_address: typed(instance, store, "get_interface_mac_address")?,
            get_interface_ip4_address: typed(instance, store, "get_interface_ip4_address")?,
            get_interface_ip4_netmask: typed(instance, store, "get_interface_ip4_netmask")?,
        })
    }
}

fn typed<P: WasmParams, R: WasmResults>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &'static str,
) -> Result<TypedFunc<P, R>, EngineError> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or(EngineError::MissingExport(name))?;
    func.typed::<P, R>(&*store)
        .map_err(|err| EngineError::ExportMismatch {
            name,
            reason: format!("{err:#}"),
        })
}

/// A network engine running inside wasmtime
pub struct WasmEngine {
    store: Store<HostState>,
    memory: Memory,
    exports: Exports,
}

impl WasmEngine {
    /// Compile and instantiate an engine from binary or text format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let engine = wasmtime::Engine::default();
        let module = Module::new(&engine, bytes)?;

        let mut linker = Linker::new(&engine);
        linker.func_wrap(IMPORT_MODULE, "register_tap_interface", register_tap_interface)?;
        linker.func_wrap(IMPORT_MODULE, "receive_frame", receive_frame)?;

        let mut store = Store::new(&engine, HostState::default());
        let instance = linker.instantiate(&mut store, &module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(EngineError::MissingExport("memory"))?;
        let exports = Exports::resolve(&instance, &mut store)?;

        debug!(pages = memory.size(&store), "instantiated wasm engine");
        Ok(WasmEngine {
            store,
            memory,
            exports,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TapError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(&bytes)?)
    }
}

fn register_tap_interface(caller: Caller<'_, HostState>, handle: u32) {
    match caller.data().callbacks.clone() {
        Some(callbacks) => callbacks.register_interface(InterfaceHandle::new(handle)),
        None => warn!(handle, "engine registered an interface before the stack attached"),
    }
}

fn receive_frame(mut caller: Caller<'_, HostState>, handle: u32, ptr: u32, len: u32) {
    let handle = InterfaceHandle::new(handle);
    let Some(callbacks) = caller.data().callbacks.clone() else {
        return;
    };
    let Some(memory) = caller.get_export("memory").and_then(|export| export.into_memory()) else {
        warn!(%handle, "engine has no memory export, dropping frame");
        return;
    };
    let start = ptr as usize;
    match memory.data(&caller).get(start..start.saturating_add(len as usize)) {
        Some(frame) => callbacks.deliver_frame(handle, frame),
        None => warn!(%handle, ptr, len, "engine emitted an out-of-bounds frame, dropping it"),
    }
}

impl ForeignMemory for WasmEngine {
    fn alloc(&mut self, len: usize) -> Result<ForeignPtr, EngineError> {
        let size = u32::try_from(len).map_err(|_| EngineError::AllocationFailed(len))?;
        let raw = self.exports.malloc.call(&mut self.store, size)?;
        ForeignPtr::from_raw(raw).ok_or(EngineError::AllocationFailed(len))
    }

    fn free(&mut self, ptr: ForeignPtr) -> Result<(), EngineError> {
        self.exports.free.call(&mut self.store, ptr.get())?;
        Ok(())
    }

    fn write(&mut self, ptr: ForeignPtr, bytes: &[u8]) -> Result<(), EngineError> {
        self.memory
            .write(&mut self.store, ptr.offset(), bytes)
            .map_err(|_| EngineError::OutOfBounds {
                ptr: ptr.get(),
                len: bytes.len(),
            })
    }

    fn view(&self, ptr: ForeignPtr, len: usize) -> Result<&[u8], EngineError> {
        let start = ptr.offset();
        self.memory
            .data(&self.store)
            .get(start..start.saturating_add(len))
            .ok_or(EngineError::OutOfBounds { ptr: ptr.get(), len })
    }
}

impl Engine for WasmEngine {
    fn attach(&mut self, callbacks: Rc<dyn EngineCallbacks>) {
        self.store.data_mut().callbacks = Some(callbacks);
    }

    fn create_interface(
        &mut self,
        mac: ForeignPtr,
        ip: Option<ForeignPtr>,
        netmask: Option<ForeignPtr>,
    ) -> Result<InterfaceHandle, EngineError> {
        let args = (
            mac.get(),
            ForeignPtr::raw_or_null(ip),
            ForeignPtr::raw_or_null(netmask),
        );
        let raw = self.exports.create_tap_interface.call(&mut self.store, args)?;
        Ok(InterfaceHandle::new(raw))
    }

    fn remove_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError> {
        Ok(self.exports.remove_tap_interface.call(&mut self.store, handle.get())?)
    }

    fn send_frame(
        &mut self,
        handle: InterfaceHandle,
        frame: ForeignPtr,
        len: usize,
    ) -> Result<i32, EngineError> {
        let len = u32::try_from(len).map_err(|_| EngineError::OutOfBounds {
            ptr: frame.get(),
            len,
        })?;
        let args = (handle.get(), frame.get(), len);
        Ok(self.exports.send_tap_interface.call(&mut self.store, args)?)
    }

    fn enable_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError> {
        Ok(self.exports.enable_tap_interface.call(&mut self.store, handle.get())?)
    }

    fn disable_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError> {
        Ok(self.exports.disable_tap_interface.call(&mut self.store, handle.get())?)
    }

    fn mac_address(&mut self, handle: InterfaceHandle) -> Result<ForeignPtr, EngineError> {
        let raw = self.exports.get_interface_mac_address.call(&mut self.store, handle.get())?;
        ForeignPtr::from_raw(raw).ok_or(EngineError::OutOfBounds { ptr: raw, len: 6 })
    }

    fn ipv4_address(&mut self, handle: InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError> {
        let raw = self.exports.get_interface_ip4_address.call(&mut self.store, handle.get())?;
        Ok(ForeignPtr::from_raw(raw))
    }

    fn ipv4_netmask(&mut self, handle: InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError> {
        let raw = self.exports.get_interface_ip4_netmask.call(&mut self.store, handle.get())?;
        Ok(ForeignPtr::from_raw(raw))
    }
}
