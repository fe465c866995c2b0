//! Handle to interface mapping

use std::collections::HashMap;

use crate::engine::InterfaceHandle;

use super::interface::TapInterface;

/// Live interfaces of one stack, keyed by engine handle
#[derive(Debug, Default)]
pub(crate) struct Registry {
    interfaces: HashMap<InterfaceHandle, TapInterface>,
}

impl Registry {
    /// Insert an interface, returning the one it replaced
    pub fn insert(&mut self, iface: TapInterface) -> Option<TapInterface> {
        self.interfaces.insert(iface.handle(), iface)
    }

    pub fn get(&self, handle: InterfaceHandle) -> Option<&TapInterface> {
        self.interfaces.get(&handle)
    }

    pub fn remove(&mut self, handle: InterfaceHandle) -> Option<TapInterface> {
        self.interfaces.remove(&handle)
    }

    /// Handle under which this exact interface object is registered
    ///
    /// A stale object whose handle was since reused by the engine does not match.
    pub fn handle_of(&self, iface: &TapInterface) -> Option<InterfaceHandle> {
        self.interfaces
            .get(&iface.handle())
            .filter(|registered| registered.same_as(iface))
            .map(TapInterface::handle)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn interfaces(&self) -> Vec<TapInterface> {
        let mut interfaces: Vec<_> = self.interfaces.values().cloned().collect();
        interfaces.sort_by_key(TapInterface::handle);
        interfaces
    }

    pub fn drain(&mut self) -> impl Iterator<Item = TapInterface> + '_ {
        self.interfaces.drain().map(|(_, iface)| iface)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::{Rc, Weak};

    use super::*;
    use crate::iface::interface::InterfacePort;

    fn orphan(handle: u32) -> TapInterface {
        // No binding behind it; the registry never calls the port
        let port: Weak<dyn InterfacePort> = Weak::<Unreachable>::new();
        TapInterface::new(InterfaceHandle::new(handle), port, 4)
    }

    struct Unreachable;

    impl InterfacePort for Unreachable {
        fn send_frame(&self, _: InterfaceHandle, _: &[u8]) -> Result<(), crate::TapError> {
            unreachable!()
        }

        fn mac_address(&self, _: InterfaceHandle) -> Result<crate::MacAddress, crate::TapError> {
            unreachable!()
        }

        fn ipv4_address(
            &self,
            _: InterfaceHandle,
        ) -> Result<Option<std::net::Ipv4Addr>, crate::TapError> {
            unreachable!()
        }

        fn ipv4_netmask(
            &self,
            _: InterfaceHandle,
        ) -> Result<Option<std::net::Ipv4Addr>, crate::TapError> {
            unreachable!()
        }

        fn set_enabled(&self, _: InterfaceHandle, _: bool) -> Result<(), crate::TapError> {
            unreachable!()
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut registry = Registry::default();
        assert!(registry.insert(orphan(2)).is_none());
        assert!(registry.insert(orphan(1)).is_none());
        assert_eq!(registry.len(), 2);

        let handles: Vec<_> = registry.interfaces().iter().map(TapInterface::handle).collect();
        assert_eq!(handles, vec![InterfaceHandle::new(1), InterfaceHandle::new(2)]);
        assert!(registry.get(InterfaceHandle::new(3)).is_none());
    }

    #[test]
    fn replacement_returns_previous() {
        let mut registry = Registry::default();
        let first = orphan(5);
        registry.insert(first.clone());
        let previous = registry.insert(orphan(5)).unwrap();
        assert!(previous.same_as(&first));

        // The replaced object no longer resolves to the handle
        assert_eq!(registry.handle_of(&first), None);
    }

    #[test]
    fn handle_of_requires_identity() {
        let mut registry = Registry::default();
        let iface = orphan(3);
        registry.insert(iface.clone());
        assert_eq!(registry.handle_of(&iface), Some(InterfaceHandle::new(3)));
        assert_eq!(registry.handle_of(&orphan(3)), None);

        assert!(registry.remove(InterfaceHandle::new(3)).is_some());
        assert_eq!(registry.handle_of(&iface), None);
        assert!(registry.remove(InterfaceHandle::new(3)).is_none());
    }

    #[test]
    fn drain_empties() {
        let mut registry = Registry::default();
        registry.insert(orphan(1));
        registry.insert(orphan(2));
        assert_eq!(registry.drain().count(), 2);
        assert_eq!(registry.len(), 0);
    }
}
