/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use serial_traits::{
    SERIAL_PORT_PROFILE_UUID, SerialFrame, SerialPortFilter, SerialPortId, SerialPortInfo,
    SerialPortObserver,
};
use uuid::Uuid;

use crate::observer::ObserverId;
use crate::registry::PortRegistry;

/// Receives the outcome of a chooser: the granted port, or `None`. It is called exactly
/// once.
pub type SerialChooserCallback = Box<dyn FnOnce(Option<SerialPortInfo>)>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChooserSessionId(u64);

impl ChooserSessionId {
    fn next() -> ChooserSessionId {
        ChooserSessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChooserState {
    Enumerating,
    AwaitingUserChoice,
    Resolved,
}

/// The embedder side of a chooser: shows the candidate ports and reports the user's pick.
pub trait SerialChooserDelegate {
    /// Present `request` to the user. Returning `false` declines to show a chooser, and
    /// the request is resolved with no port.
    fn select_serial_port(&self, request: SerialPortSelectionRequest) -> bool;

    /// A matching port appeared while the chooser for `frame` is showing.
    fn notify_port_added(&self, _frame: &SerialFrame, _port: &SerialPortInfo) {}

    /// A port shown in the chooser for `frame` went away and can no longer be selected.
    fn notify_port_removed(&self, _frame: &SerialFrame, _port: &SerialPortInfo) {}
}

/// A pending port selection handed to the [`SerialChooserDelegate`]. Answer it with
/// [`select`](Self::select) or [`cancel`](Self::cancel); dropping it unanswered cancels.
pub struct SerialPortSelectionRequest {
    frame: SerialFrame,
    ports: Vec<SerialPortInfo>,
    session: Weak<ChooserSession>,
    response_sent: bool,
}

impl SerialPortSelectionRequest {
    pub fn frame(&self) -> &SerialFrame {
        &self.frame
    }

    /// The ports matching the request when the chooser opened, sorted by path.
    pub fn ports(&self) -> &[SerialPortInfo] {
        &self.ports
    }

    pub fn select(mut self, id: SerialPortId) {
        self.respond(Some(id));
    }

    pub fn cancel(mut self) {
        self.respond(None);
    }

    fn respond(&mut self, id: Option<SerialPortId>) {
        self.response_sent = true;
        if let Some(session) = self.session.upgrade() {
            session.on_port_chosen(id);
        }
    }
}

impl Drop for SerialPortSelectionRequest {
    fn drop(&mut self) {
        if !self.response_sent {
            self.respond(None);
        }
    }
}

fn bluetooth_port_is_allowed(allowed_ids: &[Uuid], port: &SerialPortInfo) -> bool {
    let Some(ref class_id) = port.bluetooth_service_class_id else {
        return true;
    };
    *class_id == SERIAL_PORT_PROFILE_UUID || allowed_ids.contains(class_id)
}

/// One "pick a port" interaction, from enumeration to a single answer.
///
/// The callback runs exactly once: with the chosen port after it has been granted, or with
/// `None` when the request is cancelled, declined, loses its platform connection, or the
/// session is dropped before it was answered.
pub struct ChooserSession {
    id: ChooserSessionId,
    registry: PortRegistry,
    frame: SerialFrame,
    filters: Vec<SerialPortFilter>,
    allowed_bluetooth_service_class_ids: Vec<Uuid>,
    ports: RefCell<Vec<SerialPortInfo>>,
    state: Cell<ChooserState>,
    chooser: RefCell<Option<Rc<dyn SerialChooserDelegate>>>,
    observation: Cell<Option<ObserverId>>,
    callback: RefCell<Option<SerialChooserCallback>>,
}

impl ChooserSession {
    pub fn new(
        registry: PortRegistry,
        frame: SerialFrame,
        filters: Vec<SerialPortFilter>,
        allowed_bluetooth_service_class_ids: Vec<Uuid>,
        callback: SerialChooserCallback,
    ) -> Rc<ChooserSession> {
        for filter in filters.iter().filter(|filter| !filter.is_valid()) {
            debug!("Serial port filter {filter:?} can never match");
        }
        Rc::new(ChooserSession {
            id: ChooserSessionId::next(),
            registry,
            frame,
            filters,
            allowed_bluetooth_service_class_ids,
            ports: RefCell::new(Vec::new()),
            state: Cell::new(ChooserState::Enumerating),
            chooser: RefCell::new(None),
            observation: Cell::new(None),
            callback: RefCell::new(Some(callback)),
        })
    }

    pub fn id(&self) -> ChooserSessionId {
        self.id
    }

    pub fn frame(&self) -> &SerialFrame {
        &self.frame
    }

    pub fn state(&self) -> ChooserState {
        self.state.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.get() == ChooserState::Resolved
    }

    /// The ports that can currently be picked.
    pub fn ports(&self) -> Vec<SerialPortInfo> {
        self.ports.borrow().clone()
    }

    /// Whether `port` may be offered by this session.
    pub fn display_device(&self, port: &SerialPortInfo) -> bool {
        if self.registry.is_blocklisted(port) {
            return false;
        }
        if !bluetooth_port_is_allowed(&self.allowed_bluetooth_service_class_ids, port) {
            return false;
        }
        self.filters.is_empty() || self.filters.iter().any(|filter| filter.matches(port))
    }

    /// Enumerates and filters the ports, then hands them to `chooser`. Without a chooser
    /// the session resolves to `None` straight away.
    pub fn start(self: &Rc<Self>, chooser: Option<Rc<dyn SerialChooserDelegate>>) {
        if self.state.get() != ChooserState::Enumerating {
            return;
        }

        let mut ports = self.registry.enumerate_ports();
        ports.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        ports.retain(|port| self.display_device(port));
        *self.ports.borrow_mut() = ports.clone();

        let Some(chooser) = chooser else {
            debug!("No serial chooser for {:?}, denying request", self.frame.origin);
            self.run_callback(None);
            return;
        };

        self.state.set(ChooserState::AwaitingUserChoice);
        let observer = Rc::downgrade(self) as Weak<dyn SerialPortObserver>;
        self.observation
            .set(Some(self.registry.add_observer(observer)));
        *self.chooser.borrow_mut() = Some(chooser.clone());

        let request = SerialPortSelectionRequest {
            frame: self.frame.clone(),
            ports,
            session: Rc::downgrade(self),
            response_sent: false,
        };
        if !chooser.select_serial_port(request) {
            debug!("Serial chooser declined request from {:?}", self.frame.origin);
            self.run_callback(None);
        }
    }

    /// Resolves with the port identified by `id`, if it is still on offer. A port removed
    /// since the chooser opened cannot be chosen.
    pub fn on_port_chosen(&self, id: Option<SerialPortId>) {
        if self.is_resolved() {
            return;
        }
        let Some(id) = id else {
            self.run_callback(None);
            return;
        };

        let port = self.ports.borrow().iter().find(|port| port.id == id).cloned();
        match port {
            Some(port) if self.registry.grant(&self.frame.origin, &port) => {
                self.run_callback(Some(port))
            },
            _ => {
                debug!("Serial port {id} is not available to choose");
                self.run_callback(None);
            },
        }
    }

    pub fn cancel(&self) {
        self.run_callback(None);
    }

    fn stop_observing(&self) {
        if let Some(observation) = self.observation.take() {
            self.registry.remove_observer(observation);
        }
        self.chooser.borrow_mut().take();
    }

    fn run_callback(&self, port: Option<SerialPortInfo>) {
        self.state.set(ChooserState::Resolved);
        self.stop_observing();
        let callback = self.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback(port);
        }
    }
}

impl SerialPortObserver for ChooserSession {
    fn on_port_added(&self, port: &SerialPortInfo) {
        if self.state.get() != ChooserState::AwaitingUserChoice || !self.display_device(port) {
            return;
        }
        {
            let mut ports = self.ports.borrow_mut();
            if ports.iter().any(|known| known.id == port.id) {
                return;
            }
            ports.push(port.clone());
        }
        let chooser = self.chooser.borrow().clone();
        if let Some(chooser) = chooser {
            chooser.notify_port_added(&self.frame, port);
        }
    }

    fn on_port_removed(&self, port: &SerialPortInfo) {
        let removed = {
            let mut ports = self.ports.borrow_mut();
            let before = ports.len();
            ports.retain(|known| known.id != port.id);
            ports.len() != before
        };
        if !removed {
            return;
        }
        let chooser = self.chooser.borrow().clone();
        if let Some(chooser) = chooser {
            chooser.notify_port_removed(&self.frame, port);
        }
    }

    fn on_port_manager_connection_error(&self) {
        self.ports.borrow_mut().clear();
        self.run_callback(None);
    }

    fn on_registry_shutdown(&self) {
        self.run_callback(None);
    }
}

impl Drop for ChooserSession {
    fn drop(&mut self) {
        self.run_callback(None);
    }
}
