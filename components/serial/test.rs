/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A scriptable stand-in for the platform serial service, for tests and for embedders
//! running without serial hardware.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crossbeam_channel::Sender;
use indexmap::IndexMap;
use serial_traits::{
    SerialDeviceService, SerialError, SerialPortId, SerialPortInfo, SerialPortManager,
    SerialPortManagerEvent,
};
use uuid::Uuid;

pub fn usb_port(path: &str, vendor_id: u16, product_id: Option<u16>) -> SerialPortInfo {
    let mut port = SerialPortInfo::new(path);
    port.vendor_id = Some(vendor_id);
    port.product_id = product_id;
    port
}

pub fn bluetooth_port(path: &str, service_class_id: Uuid) -> SerialPortInfo {
    let mut port = SerialPortInfo::new(path);
    port.bluetooth_service_class_id = Some(service_class_id);
    port
}

/// A USB port that reports a display name and a stable identity, so grants for it can be
/// stored persistently.
pub fn persistent_usb_port(
    path: &str,
    vendor_id: u16,
    product_id: u16,
    serial: &str,
) -> SerialPortInfo {
    let mut port = usb_port(path, vendor_id, Some(product_id));
    port.display_name = Some(format!("USB serial {vendor_id:04x}:{product_id:04x}"));
    port.serial_number = Some(serial.to_owned());
    port.persistent_id = Some(format!("usb-{vendor_id:04x}-{product_id:04x}-{serial}"));
    port
}

#[derive(Default)]
struct FakeServiceState {
    ports: RefCell<IndexMap<SerialPortId, SerialPortInfo>>,
    client: RefCell<Option<Sender<SerialPortManagerEvent>>>,
    unavailable: Cell<bool>,
    fail_get_devices: Cell<bool>,
    bind_count: Cell<usize>,
}

impl FakeServiceState {
    fn send(&self, event: SerialPortManagerEvent) {
        let client = self.client.borrow();
        if let Some(client) = client.as_ref() {
            let _ = client.send(event);
        }
    }
}

/// A platform serial service whose ports are added and removed by hand. Hot-plug events
/// are queued for the connected client just as a real service would deliver them.
#[derive(Default)]
pub struct FakeSerialDeviceService {
    state: Rc<FakeServiceState>,
}

impl FakeSerialDeviceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports(ports: impl IntoIterator<Item = SerialPortInfo>) -> Self {
        let service = Self::default();
        service
            .state
            .ports
            .borrow_mut()
            .extend(ports.into_iter().map(|port| (port.id, port)));
        service
    }

    pub fn ports(&self) -> Vec<SerialPortInfo> {
        self.state.ports.borrow().values().cloned().collect()
    }

    /// Attaches `port`, queuing a `PortAdded` event for the client.
    pub fn add_port(&self, port: SerialPortInfo) {
        self.state.ports.borrow_mut().insert(port.id, port.clone());
        self.state.send(SerialPortManagerEvent::PortAdded(port));
    }

    /// Detaches the port with `id`, queuing a `PortRemoved` event for the client.
    pub fn remove_port(&self, id: &SerialPortId) -> Option<SerialPortInfo> {
        let port = self.state.ports.borrow_mut().shift_remove(id)?;
        self.state
            .send(SerialPortManagerEvent::PortRemoved(port.clone()));
        Some(port)
    }

    /// Tells the client the service is going away, then forgets it.
    pub fn disconnect(&self) {
        self.state.send(SerialPortManagerEvent::Disconnected);
        self.state.client.borrow_mut().take();
    }

    /// Forgets the client without a word, as a crashed service would.
    pub fn drop_client(&self) {
        self.state.client.borrow_mut().take();
    }

    /// While unavailable, binding a port manager fails.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.set(!available);
    }

    pub fn set_fail_get_devices(&self, fail: bool) {
        self.state.fail_get_devices.set(fail);
    }

    pub fn bind_count(&self) -> usize {
        self.state.bind_count.get()
    }

    pub fn has_client(&self) -> bool {
        self.state.client.borrow().is_some()
    }
}

impl SerialDeviceService for FakeSerialDeviceService {
    fn bind_port_manager(&self) -> Result<Rc<dyn SerialPortManager>, SerialError> {
        if self.state.unavailable.get() {
            return Err(SerialError::NotSupported);
        }
        self.state.bind_count.set(self.state.bind_count.get() + 1);
        Ok(Rc::new(FakePortManager {
            state: self.state.clone(),
        }))
    }
}

struct FakePortManager {
    state: Rc<FakeServiceState>,
}

impl SerialPortManager for FakePortManager {
    fn set_client(&self, client: Sender<SerialPortManagerEvent>) -> Result<(), SerialError> {
        *self.state.client.borrow_mut() = Some(client);
        Ok(())
    }

    fn get_devices(&self) -> Result<Vec<SerialPortInfo>, SerialError> {
        if self.state.fail_get_devices.get() {
            return Err(SerialError::Disconnected);
        }
        Ok(self.state.ports.borrow().values().cloned().collect())
    }
}
