/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use crossbeam_channel::{Receiver, TryRecvError};
use indexmap::IndexMap;
use log::{debug, warn};
use serial_traits::blocklist::SerialBlocklist;
use serial_traits::{
    SerialDeviceService, SerialPortId, SerialPortInfo, SerialPortManager,
    SerialPortManagerEvent, SerialPortObserver,
};
use url::Origin;

use crate::observer::{ObserverId, ObserverList};
use crate::permission_store::PersistentGrantStore;
use crate::prefs::SerialPreferences;

/// The source of truth for which serial ports exist and which origins may use them.
///
/// A `PortRegistry` is a handle: cloning it does not create a new registry. It belongs to
/// the thread that created it. Events from the platform service are queued on a channel
/// and only applied when [`PortRegistry::spin_event_loop`] is called, so every change to
/// the port cache and the grant table happens on the owning thread.
///
/// The registry fails closed. When the platform service cannot be reached it reports no
/// ports and no ephemeral grants rather than an error, and losing the connection drops
/// everything that was learned through it.
#[derive(Clone)]
pub struct PortRegistry(Rc<PortRegistryInner>);

struct PortRegistryInner {
    device_service: Rc<dyn SerialDeviceService>,
    port_manager: RefCell<Option<Rc<dyn SerialPortManager>>>,
    client_receiver: RefCell<Option<Receiver<SerialPortManagerEvent>>>,
    /// Known ports, in the order the platform reported them.
    port_info: RefCell<IndexMap<SerialPortId, SerialPortInfo>>,
    ephemeral_ports: RefCell<HashMap<Origin, HashSet<SerialPortId>>>,
    persistent_store: RefCell<Option<Rc<dyn PersistentGrantStore>>>,
    blocklist: Option<SerialBlocklist>,
    prefs: SerialPreferences,
    observers: ObserverList,
}

impl Drop for PortRegistryInner {
    fn drop(&mut self) {
        self.observers
            .notify(|observer| observer.on_registry_shutdown());
        self.observers.clear();
    }
}

impl PortRegistry {
    pub fn new(device_service: Rc<dyn SerialDeviceService>, prefs: SerialPreferences) -> Self {
        Self(Rc::new(PortRegistryInner {
            device_service,
            port_manager: RefCell::new(None),
            client_receiver: RefCell::new(None),
            port_info: RefCell::new(IndexMap::new()),
            ephemeral_ports: RefCell::new(HashMap::new()),
            persistent_store: RefCell::new(None),
            blocklist: prefs.blocklist(),
            prefs,
            observers: ObserverList::default(),
        }))
    }

    pub fn with_persistent_store(self, store: Rc<dyn PersistentGrantStore>) -> Self {
        self.set_persistent_store(store);
        self
    }

    pub fn set_persistent_store(&self, store: Rc<dyn PersistentGrantStore>) {
        *self.0.persistent_store.borrow_mut() = Some(store);
    }

    pub fn prefs(&self) -> &SerialPreferences {
        &self.0.prefs
    }

    pub fn is_connected(&self) -> bool {
        self.0.port_manager.borrow().is_some()
    }

    /// The live connection to the platform service, establishing it first if needed.
    pub fn port_manager(&self) -> Option<Rc<dyn SerialPortManager>> {
        self.ensure_port_manager_connection()
    }

    /// All known ports, in the order they were reported. This never waits on the
    /// platform: when there is no connection one is attempted, and whatever the cache
    /// holds afterwards is returned.
    pub fn enumerate_ports(&self) -> Vec<SerialPortInfo> {
        self.ensure_port_manager_connection();
        self.0.port_info.borrow().values().cloned().collect()
    }

    pub fn port_info(&self, id: &SerialPortId) -> Option<SerialPortInfo> {
        self.0.port_info.borrow().get(id).cloned()
    }

    pub fn is_blocklisted(&self, port: &SerialPortInfo) -> bool {
        self.0
            .blocklist
            .as_ref()
            .is_some_and(|blocklist| blocklist.is_excluded(port))
    }

    /// Lets `origin` use `port` without asking again. Granting twice is the same as
    /// granting once. Ports that are not currently attached cannot be granted, and
    /// `false` is returned for them.
    pub fn grant(&self, origin: &Origin, port: &SerialPortInfo) -> bool {
        let Some(live_port) = self.port_info(&port.id) else {
            debug!("Not granting {} to {:?}: port is gone", port.id, origin);
            return false;
        };

        self.0
            .ephemeral_ports
            .borrow_mut()
            .entry(origin.clone())
            .or_default()
            .insert(live_port.id);

        if let Some((store, persistent_id)) = self.persistent_entry(&live_port) {
            store.grant(origin, &persistent_id);
        }
        true
    }

    pub fn has_grant(&self, origin: &Origin, port: &SerialPortInfo) -> bool {
        if self.is_blocklisted(port) {
            return false;
        }

        let has_ephemeral_grant = self
            .0
            .ephemeral_ports
            .borrow()
            .get(origin)
            .is_some_and(|ports| ports.contains(&port.id));
        if has_ephemeral_grant {
            return true;
        }

        // Persistent grants are checked against the attached port, not the caller's copy.
        let Some(live_port) = self.port_info(&port.id) else {
            return false;
        };
        self.persistent_entry(&live_port)
            .is_some_and(|(store, persistent_id)| store.contains(origin, &persistent_id))
    }

    /// Withdraws whatever `origin` was granted for the port with `id`.
    pub fn revoke(&self, origin: &Origin, id: &SerialPortId) {
        {
            let mut ephemeral_ports = self.0.ephemeral_ports.borrow_mut();
            if let Some(ports) = ephemeral_ports.get_mut(origin) {
                ports.remove(id);
                if ports.is_empty() {
                    ephemeral_ports.remove(origin);
                }
            }
        }

        let Some(port) = self.port_info(id) else {
            return;
        };
        if let Some((store, persistent_id)) = self.persistent_entry(&port) {
            store.revoke(origin, &persistent_id);
        }
        self.0
            .observers
            .notify(|observer| observer.on_permission_revoked(origin, &port));
    }

    /// The number of (origin, port) pairs with an ephemeral grant.
    pub fn ephemeral_grant_count(&self) -> usize {
        self.0
            .ephemeral_ports
            .borrow()
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn add_observer(&self, observer: Weak<dyn SerialPortObserver>) -> ObserverId {
        self.0.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.0.observers.remove(id);
    }

    pub fn observer_count(&self) -> usize {
        self.0.observers.len()
    }

    /// Applies every event the platform has queued. Returns whether the connection is
    /// still up afterwards.
    pub fn spin_event_loop(&self) -> bool {
        loop {
            let event = {
                let receiver = self.0.client_receiver.borrow();
                let Some(receiver) = receiver.as_ref() else {
                    return false;
                };
                receiver.try_recv()
            };
            match event {
                Ok(SerialPortManagerEvent::PortAdded(port)) => self.on_port_added(port),
                Ok(SerialPortManagerEvent::PortRemoved(port)) => self.on_port_removed(port),
                Ok(SerialPortManagerEvent::Disconnected) | Err(TryRecvError::Disconnected) => {
                    self.on_port_manager_connection_error();
                    return false;
                },
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    pub fn on_port_added(&self, port: SerialPortInfo) {
        // A fresh report invalidates anything granted under the same id.
        {
            let mut ephemeral_ports = self.0.ephemeral_ports.borrow_mut();
            for ports in ephemeral_ports.values_mut() {
                ports.remove(&port.id);
            }
            ephemeral_ports.retain(|_, ports| !ports.is_empty());
        }
        self.0
            .port_info
            .borrow_mut()
            .entry(port.id)
            .or_insert_with(|| port.clone());

        debug!("Serial port {} added at {}", port.id, port.path.display());
        self.0
            .observers
            .notify(|observer| observer.on_port_added(&port));
    }

    pub fn on_port_removed(&self, port: SerialPortInfo) {
        let port = self
            .0
            .port_info
            .borrow_mut()
            .shift_remove(&port.id)
            .unwrap_or(port);
        {
            let mut ephemeral_ports = self.0.ephemeral_ports.borrow_mut();
            for ports in ephemeral_ports.values_mut() {
                ports.remove(&port.id);
            }
            ephemeral_ports.retain(|_, ports| !ports.is_empty());
        }

        debug!("Serial port {} removed from {}", port.id, port.path.display());
        self.0
            .observers
            .notify(|observer| observer.on_port_removed(&port));
    }

    pub fn on_port_manager_connection_error(&self) {
        warn!("Lost connection to the serial port manager");
        let port_manager = self.0.port_manager.take();
        let client_receiver = self.0.client_receiver.take();
        drop((port_manager, client_receiver));

        self.0.port_info.borrow_mut().clear();
        self.0.ephemeral_ports.borrow_mut().clear();

        self.0
            .observers
            .notify(|observer| observer.on_port_manager_connection_error());
    }

    fn persistent_entry(
        &self,
        port: &SerialPortInfo,
    ) -> Option<(Rc<dyn PersistentGrantStore>, String)> {
        if !self.0.prefs.dom_serial_persistent_permissions_enabled ||
            !port.can_store_persistent_entry()
        {
            return None;
        }
        let store = self.0.persistent_store.borrow().clone()?;
        let persistent_id = port.persistent_id.clone()?;
        Some((store, persistent_id))
    }

    fn ensure_port_manager_connection(&self) -> Option<Rc<dyn SerialPortManager>> {
        if let Some(port_manager) = self.0.port_manager.borrow().clone() {
            return Some(port_manager);
        }

        let port_manager = match self.0.device_service.bind_port_manager() {
            Ok(port_manager) => port_manager,
            Err(error) => {
                warn!("Could not bind the serial port manager: {error}");
                return None;
            },
        };

        let (client_sender, client_receiver) = crossbeam_channel::unbounded();
        if let Err(error) = port_manager.set_client(client_sender) {
            warn!("Could not register with the serial port manager: {error}");
            return None;
        }
        *self.0.port_manager.borrow_mut() = Some(port_manager.clone());
        *self.0.client_receiver.borrow_mut() = Some(client_receiver);

        match port_manager.get_devices() {
            Ok(ports) => {
                let mut port_info = self.0.port_info.borrow_mut();
                for port in ports {
                    port_info.entry(port.id).or_insert(port);
                }
                debug!("Connected to the serial port manager, {} ports", port_info.len());
                drop(port_info);
                Some(port_manager)
            },
            Err(error) => {
                warn!("Could not enumerate serial ports: {error}");
                self.on_port_manager_connection_error();
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use serial_traits::{SerialError, SerialPortManagerEvent};
    use url::Url;

    use super::*;

    struct UnavailableService;

    impl SerialDeviceService for UnavailableService {
        fn bind_port_manager(&self) -> Result<Rc<dyn SerialPortManager>, SerialError> {
            Err(SerialError::NotSupported)
        }
    }

    struct StaticManager {
        ports: Vec<SerialPortInfo>,
        client: RefCell<Option<crossbeam_channel::Sender<SerialPortManagerEvent>>>,
    }

    impl SerialPortManager for StaticManager {
        fn set_client(
            &self,
            client: crossbeam_channel::Sender<SerialPortManagerEvent>,
        ) -> Result<(), SerialError> {
            *self.client.borrow_mut() = Some(client);
            Ok(())
        }

        fn get_devices(&self) -> Result<Vec<SerialPortInfo>, SerialError> {
            Ok(self.ports.clone())
        }
    }

    struct StaticService {
        ports: Vec<SerialPortInfo>,
        binds: Cell<usize>,
    }

    impl SerialDeviceService for StaticService {
        fn bind_port_manager(&self) -> Result<Rc<dyn SerialPortManager>, SerialError> {
            self.binds.set(self.binds.get() + 1);
            Ok(Rc::new(StaticManager {
                ports: self.ports.clone(),
                client: RefCell::new(None),
            }))
        }
    }

    fn origin() -> Origin {
        Url::parse("https://serial.example").unwrap().origin()
    }

    #[test]
    fn unreachable_service_yields_no_ports() {
        let registry = PortRegistry::new(Rc::new(UnavailableService), Default::default());
        assert!(registry.enumerate_ports().is_empty());
        assert!(!registry.is_connected());
        assert!(registry.port_manager().is_none());
        assert!(!registry.spin_event_loop());
    }

    #[test]
    fn connection_is_established_once() {
        let service = Rc::new(StaticService {
            ports: vec![SerialPortInfo::new("/dev/ttyS0")],
            binds: Cell::new(0),
        });
        let registry = PortRegistry::new(service.clone(), Default::default());
        assert_eq!(registry.enumerate_ports().len(), 1);
        assert_eq!(registry.enumerate_ports().len(), 1);
        assert_eq!(service.binds.get(), 1);
    }

    #[test]
    fn grants_for_unknown_ports_are_refused() {
        let registry = PortRegistry::new(Rc::new(UnavailableService), Default::default());
        let port = SerialPortInfo::new("/dev/ttyS0");
        assert!(!registry.grant(&origin(), &port));
        assert!(!registry.has_grant(&origin(), &port));
        assert_eq!(registry.ephemeral_grant_count(), 0);
    }

    #[test]
    fn re_added_port_drops_stale_grants() {
        let port = SerialPortInfo::new("/dev/ttyS0");
        let service = Rc::new(StaticService {
            ports: vec![port.clone()],
            binds: Cell::new(0),
        });
        let registry = PortRegistry::new(service, Default::default());
        registry.enumerate_ports();
        assert!(registry.grant(&origin(), &port));
        registry.on_port_added(port.clone());
        assert!(!registry.has_grant(&origin(), &port));
        assert!(registry.0.ephemeral_ports.borrow().is_empty());
    }
}
