/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use servo_serial::prefs::SerialPreferences;
use servo_serial::test::FakeSerialDeviceService;
use servo_serial::{
    FrameId, PortRegistry, SerialChooserCallback, SerialChooserDelegate, SerialFrame,
    SerialPortInfo, SerialPortObserver, SerialPortSelectionRequest,
};
use url::{Origin, Url};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn origin(url: &str) -> Origin {
    Url::parse(url).unwrap().origin()
}

pub fn frame(url: &str) -> SerialFrame {
    SerialFrame::new(FrameId::next(), origin(url))
}

pub fn weak<T: SerialPortObserver + 'static>(observer: &Rc<T>) -> Weak<dyn SerialPortObserver> {
    Rc::downgrade(observer) as Weak<dyn SerialPortObserver>
}

pub fn registry_with(
    ports: impl IntoIterator<Item = SerialPortInfo>,
) -> (Rc<FakeSerialDeviceService>, PortRegistry) {
    registry_with_prefs(ports, SerialPreferences::default())
}

pub fn registry_with_prefs(
    ports: impl IntoIterator<Item = SerialPortInfo>,
    prefs: SerialPreferences,
) -> (Rc<FakeSerialDeviceService>, PortRegistry) {
    init_logger();
    let service = Rc::new(FakeSerialDeviceService::with_ports(ports));
    let registry = PortRegistry::new(service.clone(), prefs);
    (service, registry)
}

/// Records every answer a chooser callback receives.
#[derive(Clone, Default)]
pub struct Outcomes(Rc<RefCell<Vec<Option<SerialPortInfo>>>>);

impl Outcomes {
    pub fn callback(&self) -> SerialChooserCallback {
        let outcomes = self.0.clone();
        Box::new(move |port| outcomes.borrow_mut().push(port))
    }

    pub fn count(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn last(&self) -> Option<Option<SerialPortInfo>> {
        self.0.borrow().last().cloned()
    }

    /// The single answer received, or `None` when there were zero or several.
    pub fn only(&self) -> Option<Option<SerialPortInfo>> {
        let outcomes = self.0.borrow();
        match outcomes.as_slice() {
            [outcome] => Some(outcome.clone()),
            _ => None,
        }
    }
}

/// A chooser that keeps the requests it is shown so the test can answer them later.
#[derive(Default)]
pub struct RecordingChooser {
    pub requests: RefCell<Vec<SerialPortSelectionRequest>>,
    pub added: RefCell<Vec<SerialPortInfo>>,
    pub removed: RefCell<Vec<SerialPortInfo>>,
    pub decline: Cell<bool>,
}

impl RecordingChooser {
    pub fn take_request(&self) -> Option<SerialPortSelectionRequest> {
        let mut requests = self.requests.borrow_mut();
        if requests.is_empty() {
            None
        } else {
            Some(requests.remove(0))
        }
    }

    pub fn presented_paths(&self) -> Vec<Vec<String>> {
        self.requests
            .borrow()
            .iter()
            .map(|request| {
                request
                    .ports()
                    .iter()
                    .map(|port| port.path.display().to_string())
                    .collect()
            })
            .collect()
    }
}

impl SerialChooserDelegate for RecordingChooser {
    fn select_serial_port(&self, request: SerialPortSelectionRequest) -> bool {
        if self.decline.get() {
            return false;
        }
        self.requests.borrow_mut().push(request);
        true
    }

    fn notify_port_added(&self, _frame: &SerialFrame, port: &SerialPortInfo) {
        self.added.borrow_mut().push(port.clone());
    }

    fn notify_port_removed(&self, _frame: &SerialFrame, port: &SerialPortInfo) {
        self.removed.borrow_mut().push(port.clone());
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub added: RefCell<Vec<SerialPortInfo>>,
    pub removed: RefCell<Vec<SerialPortInfo>>,
    pub revoked: RefCell<Vec<(Origin, SerialPortInfo)>>,
    pub connection_errors: Cell<usize>,
    pub shutdowns: Cell<usize>,
}

impl SerialPortObserver for RecordingObserver {
    fn on_port_added(&self, port: &SerialPortInfo) {
        self.added.borrow_mut().push(port.clone());
    }

    fn on_port_removed(&self, port: &SerialPortInfo) {
        self.removed.borrow_mut().push(port.clone());
    }

    fn on_port_manager_connection_error(&self) {
        self.connection_errors.set(self.connection_errors.get() + 1);
    }

    fn on_permission_revoked(&self, origin: &Origin, port: &SerialPortInfo) {
        self.revoked
            .borrow_mut()
            .push((origin.clone(), port.clone()));
    }

    fn on_registry_shutdown(&self) {
        self.shutdowns.set(self.shutdowns.get() + 1);
    }
}
