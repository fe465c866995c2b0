#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;

use tap_bridge::{
    Engine, EngineCallbacks, EngineError, ForeignMemory, ForeignPtr, InterfaceHandle, StackConfig,
    TapStack,
};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

const MEMORY_SIZE: usize = 1 << 20;
const SLOT_BASE: usize = 64;
const SLOT_SIZE: usize = 16;
const HEAP_BASE: usize = 8192;

/// Engine-side view of one interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub mac: [u8; 6],
    pub ipv4: Option<([u8; 4], [u8; 4])>,
    pub enabled: bool,
}

#[derive(Default)]
struct Shared {
    callbacks: Option<Rc<dyn EngineCallbacks>>,
    next_handle: u32,
    skip_registration: bool,
    loopback: bool,
    send_status: i32,
    live_allocations: usize,
    interfaces: BTreeMap<u32, InterfaceState>,
    removed: Vec<InterfaceHandle>,
    sent: Vec<(InterfaceHandle, Vec<u8>)>,
}

/// In-process engine with its own linear memory
///
/// Addresses are written into per-interface slots on every query, so the
/// bytes handed back always reflect the state held in [`Probe`].
pub struct LoopbackEngine {
    memory: Vec<u8>,
    next_free: usize,
    allocations: HashMap<u32, usize>,
    shared: Rc<RefCell<Shared>>,
}

/// Test-side handle into a [`LoopbackEngine`]
#[derive(Clone)]
pub struct Probe {
    shared: Rc<RefCell<Shared>>,
}

pub fn loopback_engine() -> (LoopbackEngine, Probe) {
    let shared = Rc::new(RefCell::new(Shared {
        next_handle: 1,
        ..Shared::default()
    }));
    let engine = LoopbackEngine {
        memory: vec![0; MEMORY_SIZE],
        next_free: HEAP_BASE,
        allocations: HashMap::new(),
        shared: Rc::clone(&shared),
    };
    (engine, Probe { shared })
}

/// Stack over a fresh loopback engine, dispatcher spawned on the current LocalSet
pub fn loopback_stack(config: StackConfig) -> (TapStack<LoopbackEngine>, Probe) {
    let (engine, probe) = loopback_engine();
    (TapStack::spawn_local(engine, config), probe)
}

/// Log to the test writer; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `test` inside a LocalSet on a current-thread runtime
pub fn run_local<F: Future<Output = ()>>(test: F) {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    LocalSet::new().block_on(&runtime, test);
}

/// Give spawned local tasks (the dispatcher) a chance to run
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

impl Probe {
    /// Emit a frame from the engine side, as if the network produced it
    pub fn emit(&self, handle: InterfaceHandle, frame: &[u8]) {
        let callbacks = self.shared.borrow().callbacks.clone();
        if let Some(callbacks) = callbacks {
            callbacks.deliver_frame(handle, frame);
        }
    }

    /// Announce a handle the stack never asked for
    pub fn register(&self, handle: InterfaceHandle) {
        let callbacks = self.shared.borrow().callbacks.clone();
        if let Some(callbacks) = callbacks {
            callbacks.register_interface(handle);
        }
    }

    pub fn set_loopback(&self, loopback: bool) {
        self.shared.borrow_mut().loopback = loopback;
    }

    pub fn set_send_status(&self, status: i32) {
        self.shared.borrow_mut().send_status = status;
    }

    pub fn skip_registration(&self) {
        self.shared.borrow_mut().skip_registration = true;
    }

    pub fn set_ipv4(&self, handle: InterfaceHandle, ipv4: Option<([u8; 4], [u8; 4])>) {
        if let Some(state) = self.shared.borrow_mut().interfaces.get_mut(&handle.get()) {
            state.ipv4 = ipv4;
        }
    }

    pub fn interface(&self, handle: InterfaceHandle) -> Option<InterfaceState> {
        self.shared.borrow().interfaces.get(&handle.get()).cloned()
    }

    pub fn interface_count(&self) -> usize {
        self.shared.borrow().interfaces.len()
    }

    pub fn removed(&self) -> Vec<InterfaceHandle> {
        self.shared.borrow().removed.clone()
    }

    pub fn sent(&self) -> Vec<(InterfaceHandle, Vec<u8>)> {
        self.shared.borrow().sent.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.shared.borrow().live_allocations
    }
}

impl LoopbackEngine {
    fn read(&self, ptr: ForeignPtr, len: usize) -> Result<Vec<u8>, EngineError> {
        Ok(self.view(ptr, len)?.to_vec())
    }

    fn slot(handle: InterfaceHandle) -> usize {
        SLOT_BASE + handle.get() as usize * SLOT_SIZE
    }

    fn state(&self, handle: InterfaceHandle) -> Result<InterfaceState, EngineError> {
        self.shared
            .borrow()
            .interfaces
            .get(&handle.get())
            .cloned()
            .ok_or_else(|| EngineError::Trap(format!("unknown interface {handle}")))
    }

    fn publish(&mut self, offset: usize, bytes: &[u8]) -> Result<ForeignPtr, EngineError> {
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
        ForeignPtr::from_raw(offset as u32).ok_or(EngineError::OutOfBounds {
            ptr: offset as u32,
            len: bytes.len(),
        })
    }
}

impl ForeignMemory for LoopbackEngine {
    fn alloc(&mut self, len: usize) -> Result<ForeignPtr, EngineError> {
        let start = self.next_free;
        let end = start + ((len + 7) & !7);
        if end > self.memory.len() {
            return Err(EngineError::AllocationFailed(len));
        }
        self.next_free = end;
        self.allocations.insert(start as u32, len);
        self.shared.borrow_mut().live_allocations += 1;
        ForeignPtr::from_raw(start as u32).ok_or(EngineError::AllocationFailed(len))
    }

    fn free(&mut self, ptr: ForeignPtr) -> Result<(), EngineError> {
        self.allocations
            .remove(&ptr.get())
            .ok_or_else(|| EngineError::Trap(format!("free of unknown pointer {ptr}")))?;
        self.shared.borrow_mut().live_allocations -= 1;
        Ok(())
    }

    fn write(&mut self, ptr: ForeignPtr, bytes: &[u8]) -> Result<(), EngineError> {
        let start = ptr.get() as usize;
        let out_of_bounds = EngineError::OutOfBounds {
            ptr: ptr.get(),
            len: bytes.len(),
        };
        self.memory
            .get_mut(start..start + bytes.len())
            .ok_or(out_of_bounds)?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn view(&self, ptr: ForeignPtr, len: usize) -> Result<&[u8], EngineError> {
        let start = ptr.get() as usize;
        self.memory
            .get(start..start + len)
            .ok_or(EngineError::OutOfBounds { ptr: ptr.get(), len })
    }
}

impl Engine for LoopbackEngine {
    fn attach(&mut self, callbacks: Rc<dyn EngineCallbacks>) {
        self.shared.borrow_mut().callbacks = Some(callbacks);
    }

    fn create_interface(
        &mut self,
        mac: ForeignPtr,
        ip: Option<ForeignPtr>,
        netmask: Option<ForeignPtr>,
    ) -> Result<InterfaceHandle, EngineError> {
        let mut state = InterfaceState::default();
        state.mac.copy_from_slice(&self.read(mac, 6)?);
        if let (Some(ip), Some(netmask)) = (ip, netmask) {
            let mut address = [0; 4];
            let mut mask = [0; 4];
            address.copy_from_slice(&self.read(ip, 4)?);
            mask.copy_from_slice(&self.read(netmask, 4)?);
            state.ipv4 = Some((address, mask));
        }

        let (handle, callbacks) = {
            let mut shared = self.shared.borrow_mut();
            let handle = InterfaceHandle::new(shared.next_handle);
            shared.next_handle += 1;
            shared.interfaces.insert(handle.get(), state);
            let callbacks = if shared.skip_registration {
                None
            } else {
                shared.callbacks.clone()
            };
            (handle, callbacks)
        };
        if let Some(callbacks) = callbacks {
            callbacks.register_interface(handle);
        }
        Ok(handle)
    }

    fn remove_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError> {
        let mut shared = self.shared.borrow_mut();
        shared.interfaces.remove(&handle.get());
        shared.removed.push(handle);
        Ok(())
    }

    fn send_frame(
        &mut self,
        handle: InterfaceHandle,
        frame: ForeignPtr,
        len: usize,
    ) -> Result<i32, EngineError> {
        let bytes = self.read(frame, len)?;
        let (status, callbacks) = {
            let mut shared = self.shared.borrow_mut();
            shared.sent.push((handle, bytes));
            let callbacks = if shared.loopback {
                shared.callbacks.clone()
            } else {
                None
            };
            (shared.send_status, callbacks)
        };
        if status != 0 {
            return Ok(status);
        }
        if let Some(callbacks) = callbacks {
            // Hand out a view into our own memory, like a real engine would
            let start = frame.get() as usize;
            callbacks.deliver_frame(handle, &self.memory[start..start + len]);
        }
        Ok(0)
    }

    fn enable_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError> {
        if let Some(state) = self.shared.borrow_mut().interfaces.get_mut(&handle.get()) {
            state.enabled = true;
        }
        Ok(())
    }

    fn disable_interface(&mut self, handle: InterfaceHandle) -> Result<(), EngineError> {
        if let Some(state) = self.shared.borrow_mut().interfaces.get_mut(&handle.get()) {
            state.enabled = false;
        }
        Ok(())
    }

    fn mac_address(&mut self, handle: InterfaceHandle) -> Result<ForeignPtr, EngineError> {
        let state = self.state(handle)?;
        self.publish(Self::slot(handle), &state.mac)
    }

    fn ipv4_address(&mut self, handle: InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError> {
        match self.state(handle)?.ipv4 {
            Some((address, _)) => Ok(Some(self.publish(Self::slot(handle) + 6, &address)?)),
            None => Ok(None),
        }
    }

    fn ipv4_netmask(&mut self, handle: InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError> {
        match self.state(handle)?.ipv4 {
            Some((_, netmask)) => Ok(Some(self.publish(Self::slot(handle) + 10, &netmask)?)),
            None => Ok(None),
        }
    }
}
