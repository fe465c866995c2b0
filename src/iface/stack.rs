//! Binding between the engine and the virtual interfaces
//!
//! [`TapStack`] owns the engine and the registry of live interfaces. Calls
//! from the engine ([`EngineCallbacks`]) are handled by a separate
//! `EngineEvents` object that only holds weak references, so the engine
//! never keeps the stack alive.
//!
//! Frames emitted by the engine are copied out immediately and handed to the
//! interface later by the [`Dispatcher`], never inside the engine call.

use std::cell::{RefCell, RefMut};
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::config::{InterfaceOptions, StackConfig};
use crate::engine::{
    copy_from_memory, Engine, EngineCallbacks, ForeignPtr, InterfaceHandle, MemoryScope,
    STATUS_OK,
};
use crate::error::{EngineError, TapError};
use crate::network::ipv4::{ipv4_octets, IPV4_ADDR_LEN};
use crate::network::mac::MAC_LEN;
use crate::network::{
    generate_mac_address, parse_mac_address, serialize_ipv4_cidr, serialize_mac_address,
    MacAddress,
};

use super::interface::{Frame, FrameInbox, InterfacePort, TapInterface};
use super::registry::Registry;

type AddressQuery<E> = fn(&mut E, InterfaceHandle) -> Result<Option<ForeignPtr>, EngineError>;

struct Binding<E> {
    engine: RefCell<E>,
    registry: Rc<RefCell<Registry>>,
}

impl<E: Engine> Binding<E> {
    fn engine_mut(&self) -> Result<RefMut<'_, E>, TapError> {
        self.engine.try_borrow_mut().map_err(|_| TapError::EngineBusy)
    }

    fn read_ipv4(
        &self,
        handle: InterfaceHandle,
        query: AddressQuery<E>,
    ) -> Result<Option<Ipv4Addr>, TapError> {
        let mut engine = self.engine_mut()?;
        let Some(ptr) = query(&mut *engine, handle)? else {
            return Ok(None);
        };
        let bytes = copy_from_memory(&*engine, ptr, IPV4_ADDR_LEN)?;
        Ok(Some(Ipv4Addr::from(ipv4_octets(&bytes)?)))
    }
}

impl<E: Engine> InterfacePort for Binding<E> {
    fn send_frame(&self, handle: InterfaceHandle, frame: &[u8]) -> Result<(), TapError> {
        let mut engine = self.engine_mut()?;
        let mut scope = MemoryScope::new(&mut *engine);
        let ptr = scope.copy_to_memory(frame)?;
        let status = scope.memory().send_frame(handle, ptr, frame.len())?;
        if status != STATUS_OK {
            return Err(TapError::SendFailed(status));
        }
        trace!(%handle, len = frame.len(), "frame handed to engine");
        Ok(())
    }

    fn mac_address(&self, handle: InterfaceHandle) -> Result<MacAddress, TapError> {
        let mut engine = self.engine_mut()?;
        let ptr = engine.mac_address(handle)?;
        let bytes = copy_from_memory(&*engine, ptr, MAC_LEN)?;
        Ok(parse_mac_address(&bytes)?)
    }

    fn ipv4_address(&self, handle: InterfaceHandle) -> Result<Option<Ipv4Addr>, TapError> {
        self.read_ipv4(handle, E::ipv4_address)
    }

    fn ipv4_netmask(&self, handle: InterfaceHandle) -> Result<Option<Ipv4Addr>, TapError> {
        self.read_ipv4(handle, E::ipv4_netmask)
    }

    fn set_enabled(&self, handle: InterfaceHandle, enabled: bool) -> Result<(), TapError> {
        let mut engine = self.engine_mut()?;
        if enabled {
            engine.enable_interface(handle)?;
        } else {
            engine.disable_interface(handle)?;
        }
        debug!(%handle, enabled, "interface state changed");
        Ok(())
    }
}

impl<E> Drop for Binding<E> {
    fn drop(&mut self) {
        // Readers of interfaces that outlive the stack must see their source end
        for iface in self.registry.borrow_mut().drain() {
            iface.detach();
        }
    }
}

struct Delivery {
    handle: InterfaceHandle,
    frame: Frame,
}

/// Engine-facing side of the binding
struct EngineEvents {
    registry: Weak<RefCell<Registry>>,
    port: Weak<dyn InterfacePort>,
    deliveries: mpsc::Sender<Delivery>,
    frame_queue_depth: usize,
}

impl EngineCallbacks for EngineEvents {
    fn register_interface(&self, handle: InterfaceHandle) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let iface = TapInterface::new(handle, self.port.clone(), self.frame_queue_depth);
        let previous = registry.borrow_mut().insert(iface);
        if let Some(previous) = previous {
            warn!(%handle, "engine registered a handle that is already live, replacing it");
            previous.detach();
        }
        debug!(%handle, "engine registered interface");
    }

    fn deliver_frame(&self, handle: InterfaceHandle, frame: &[u8]) {
        // The view dies with this call
        let frame = Bytes::copy_from_slice(frame);
        match self.deliveries.try_send(Delivery { handle, frame }) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                warn!(%handle, len = delivery.frame.len(), "delivery queue full, dropping frame");
            }
            Err(TrySendError::Closed(delivery)) => {
                debug!(%handle, len = delivery.frame.len(), "dispatcher stopped, dropping frame");
            }
        }
    }
}

/// Hands frames emitted by the engine to their interfaces
///
/// Must be polled on the same thread as the stack, usually through
/// [`tokio::task::spawn_local`]. It finishes once the stack and engine are gone.
pub struct Dispatcher {
    registry: Weak<RefCell<Registry>>,
    deliveries: mpsc::Receiver<Delivery>,
}

impl Dispatcher {
    pub async fn run(mut self) {
        while let Some(Delivery { handle, frame }) = self.deliveries.recv().await {
            self.dispatch(handle, frame);
        }
        debug!("engine detached, dispatcher stopping");
    }

    fn dispatch(&self, handle: InterfaceHandle, frame: Frame) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let iface = registry.borrow().get(handle).cloned();
        match iface {
            Some(iface) => iface.deliver(frame),
            None => debug!(%handle, len = frame.len(), "frame for unknown interface dropped"),
        }
    }
}

/// The engine together with every interface it created
pub struct TapStack<E: Engine + 'static> {
    binding: Rc<Binding<E>>,
}

impl<E: Engine + 'static> TapStack<E> {
    /// Bind `engine`; the returned [`Dispatcher`] must be driven for inbound
    /// frames to reach their interfaces
    pub fn new(mut engine: E, config: StackConfig) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::channel(config.delivery_queue_depth());
        let registry = Rc::new(RefCell::new(Registry::default()));

        let binding = Rc::new_cyclic(|weak: &Weak<Binding<E>>| {
            let port: Weak<dyn InterfacePort> = weak.clone();
            engine.attach(Rc::new(EngineEvents {
                registry: Rc::downgrade(&registry),
                port,
                deliveries: tx,
                frame_queue_depth: config.frame_queue_depth(),
            }));
            Binding {
                engine: RefCell::new(engine),
                registry: Rc::clone(&registry),
            }
        });

        let dispatcher = Dispatcher {
            registry: Rc::downgrade(&registry),
            deliveries: rx,
        };
        (TapStack { binding }, dispatcher)
    }

    /// Bind `engine` and spawn its dispatcher on the current
    /// [`LocalSet`](tokio::task::LocalSet)
    pub fn spawn_local(engine: E, config: StackConfig) -> Self {
        let (stack, dispatcher) = Self::new(engine, config);
        tokio::task::spawn_local(dispatcher.run());
        stack
    }

    /// Create an interface in the engine
    ///
    /// Nothing reaches the engine when the options do not parse. All temporary
    /// engine allocations are released whatever the outcome.
    pub fn create(&self, options: &InterfaceOptions) -> Result<TapInterface, TapError> {
        let mac = match options.mac.as_deref() {
            Some(mac) => mac.parse::<MacAddress>()?,
            None => generate_mac_address(),
        };
        let cidr = options.ip.as_deref().map(serialize_ipv4_cidr).transpose()?;

        let handle = {
            let mut engine = self.binding.engine_mut()?;
            let mut scope = MemoryScope::new(&mut *engine);
            let mac_ptr = scope.copy_to_memory(&serialize_mac_address(&mac))?;
            let (ip_ptr, netmask_ptr) = match cidr {
                Some(cidr) => (
                    Some(scope.copy_to_memory(&cidr.address().octets())?),
                    Some(scope.copy_to_memory(&cidr.netmask().octets())?),
                ),
                None => (None, None),
            };
            scope.memory().create_interface(mac_ptr, ip_ptr, netmask_ptr)?
        };

        let iface = self.interface(handle).ok_or(TapError::RegistrationFailed(handle))?;
        match cidr {
            Some(cidr) => debug!(%handle, %mac, %cidr, "created interface"),
            None => debug!(%handle, %mac, "created interface"),
        }
        Ok(iface)
    }

    /// Remove an interface from the engine and close its readers
    ///
    /// Removing an interface this stack does not know is a no-op.
    pub fn remove(&self, iface: &TapInterface) -> Result<(), TapError> {
        let handle = self.binding.registry.borrow().handle_of(iface);
        let Some(handle) = handle else {
            debug!(handle = %iface.handle(), "remove of unknown interface ignored");
            return Ok(());
        };

        self.binding.engine_mut()?.remove_interface(handle)?;
        let removed = self.binding.registry.borrow_mut().remove(handle);
        if let Some(removed) = removed {
            removed.detach();
        }
        debug!(%handle, "removed interface");
        Ok(())
    }

    pub fn interface(&self, handle: InterfaceHandle) -> Option<TapInterface> {
        self.binding.registry.borrow().get(handle).cloned()
    }

    /// Live interfaces ordered by handle
    pub fn interfaces(&self) -> Vec<TapInterface> {
        self.binding.registry.borrow().interfaces()
    }

    pub fn len(&self) -> usize {
        self.binding.registry.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with exclusive access to the engine
    ///
    /// Fails with [`TapError::EngineBusy`] when called from inside an engine call.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R, TapError> {
        let mut engine = self.binding.engine_mut()?;
        Ok(f(&mut *engine))
    }
}
