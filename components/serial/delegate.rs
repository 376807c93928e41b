/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::debug;
use serial_traits::{
    FrameId, SerialFrame, SerialPortFilter, SerialPortId, SerialPortInfo, SerialPortManager,
    SerialPortObserver,
};
use url::Origin;
use uuid::Uuid;

use crate::chooser::{
    ChooserSession, ChooserSessionId, SerialChooserCallback, SerialChooserDelegate,
};
use crate::observer::{ObserverId, ObserverList};
use crate::registry::PortRegistry;

/// Decides whether a frame may ask for serial ports at all.
pub trait SerialPermissionPolicy {
    fn can_request_port_permission(&self, frame: &SerialFrame) -> bool;
}

/// Lets any frame with a tuple origin ask. Opaque origins have nowhere to record grants.
pub struct DefaultSerialPermissionPolicy;

impl SerialPermissionPolicy for DefaultSerialPermissionPolicy {
    fn can_request_port_permission(&self, frame: &SerialFrame) -> bool {
        frame.origin.is_tuple()
    }
}

/// Identifies the chooser started by [`SerialDelegate::run_chooser`]. It carries no
/// ownership, and may be ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SerialChooserHandle {
    frame: FrameId,
    session: ChooserSessionId,
}

impl SerialChooserHandle {
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn session_id(&self) -> ChooserSessionId {
        self.session
    }
}

/// The entry point the engine uses for everything serial: running choosers, checking
/// permissions and watching for port changes on behalf of frames.
///
/// At most one chooser runs per frame. Starting another one for the same frame, destroying
/// the frame, or dropping the delegate resolves the outstanding chooser with no port.
pub struct SerialDelegate(Rc<SerialDelegateInner>);

struct SerialDelegateInner {
    registry: PortRegistry,
    chooser_delegate: RefCell<Option<Rc<dyn SerialChooserDelegate>>>,
    permission_policy: RefCell<Rc<dyn SerialPermissionPolicy>>,
    sessions: RefCell<HashMap<FrameId, Rc<ChooserSession>>>,
    observers: ObserverList,
    frame_observers: RefCell<HashMap<FrameId, Vec<ObserverId>>>,
    /// Our own registration with the registry, made when the first observer arrives.
    port_observation: Cell<Option<ObserverId>>,
}

impl SerialDelegate {
    pub fn new(registry: PortRegistry) -> Self {
        Self(Rc::new(SerialDelegateInner {
            registry,
            chooser_delegate: RefCell::new(None),
            permission_policy: RefCell::new(Rc::new(DefaultSerialPermissionPolicy)),
            sessions: RefCell::new(HashMap::new()),
            observers: ObserverList::default(),
            frame_observers: RefCell::new(HashMap::new()),
            port_observation: Cell::new(None),
        }))
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.0.registry
    }

    pub fn set_chooser_delegate(&self, chooser_delegate: Rc<dyn SerialChooserDelegate>) {
        *self.0.chooser_delegate.borrow_mut() = Some(chooser_delegate);
    }

    pub fn clear_chooser_delegate(&self) {
        self.0.chooser_delegate.borrow_mut().take();
    }

    pub fn set_permission_policy(&self, permission_policy: Rc<dyn SerialPermissionPolicy>) {
        *self.0.permission_policy.borrow_mut() = permission_policy;
    }

    /// Asks the user to pick a port for `frame`. `callback` receives the granted port, or
    /// `None`. Returns `None` when the frame may not ask, in which case `callback` has
    /// already run.
    pub fn run_chooser(
        &self,
        frame: &SerialFrame,
        filters: Vec<SerialPortFilter>,
        allowed_bluetooth_service_class_ids: Vec<Uuid>,
        callback: SerialChooserCallback,
    ) -> Option<SerialChooserHandle> {
        let previous = self.0.sessions.borrow_mut().remove(&frame.id);
        if previous.is_some() {
            debug!("Replacing serial chooser for frame {:?}", frame.id);
        }
        drop(previous);

        if !self.can_request_permission(frame) {
            debug!("Frame {:?} may not request serial ports", frame.id);
            callback(None);
            return None;
        }

        let weak_inner = Rc::downgrade(&self.0);
        let frame_id = frame.id;
        let callback: SerialChooserCallback = Box::new(move |port| {
            if let Some(inner) = weak_inner.upgrade() {
                inner.forget_resolved_session(frame_id);
            }
            callback(port);
        });

        let session = ChooserSession::new(
            self.0.registry.clone(),
            frame.clone(),
            filters,
            allowed_bluetooth_service_class_ids,
            callback,
        );
        let handle = SerialChooserHandle {
            frame: frame.id,
            session: session.id(),
        };
        // A callback run by the displaced session may re-enter, so drop it unborrowed.
        let displaced = self
            .0
            .sessions
            .borrow_mut()
            .insert(frame.id, session.clone());
        drop(displaced);

        let chooser_delegate = self.0.chooser_delegate.borrow().clone();
        session.start(chooser_delegate);
        Some(handle)
    }

    /// Whether `frame` has a chooser waiting for an answer.
    pub fn has_pending_chooser(&self, frame: FrameId) -> bool {
        self.0.sessions.borrow().contains_key(&frame)
    }

    pub fn can_request_permission(&self, frame: &SerialFrame) -> bool {
        if !self.0.registry.prefs().dom_serial_enabled {
            return false;
        }
        let permission_policy = self.0.permission_policy.borrow().clone();
        permission_policy.can_request_port_permission(frame)
    }

    pub fn has_permission(&self, frame: &SerialFrame, port: &SerialPortInfo) -> bool {
        self.0.registry.has_grant(&frame.origin, port)
    }

    pub fn revoke_permission(&self, frame: &SerialFrame, port: &SerialPortId) {
        self.0.registry.revoke(&frame.origin, port);
    }

    pub fn get_port_manager(&self, _frame: &SerialFrame) -> Option<Rc<dyn SerialPortManager>> {
        self.0.registry.port_manager()
    }

    pub fn get_port_info(&self, port: &SerialPortId) -> Option<SerialPortInfo> {
        self.0.registry.port_info(port)
    }

    /// Forwards port and permission changes to `observer` until it is removed or `frame`
    /// is destroyed. The observer is not kept alive.
    pub fn add_observer(
        &self,
        frame: FrameId,
        observer: Weak<dyn SerialPortObserver>,
    ) -> ObserverId {
        if self.0.port_observation.get().is_none() {
            let delegate_observer = Rc::downgrade(&self.0) as Weak<dyn SerialPortObserver>;
            self.0
                .port_observation
                .set(Some(self.0.registry.add_observer(delegate_observer)));
        }

        let id = self.0.observers.add(observer);
        self.0
            .frame_observers
            .borrow_mut()
            .entry(frame)
            .or_default()
            .push(id);
        id
    }

    /// Stops forwarding events to the observer registered for `frame` under `id`. Ids
    /// that were not handed out for `frame` are ignored.
    pub fn remove_observer(&self, frame: FrameId, id: ObserverId) {
        let registered = {
            let mut frame_observers = self.0.frame_observers.borrow_mut();
            let Some(ids) = frame_observers.get_mut(&frame) else {
                return;
            };
            let before = ids.len();
            ids.retain(|observer| *observer != id);
            let registered = ids.len() != before;
            if ids.is_empty() {
                frame_observers.remove(&frame);
            }
            registered
        };
        if registered {
            self.0.observers.remove(id);
        }
    }

    /// The number of observers registered for `frame`.
    pub fn observer_count(&self, frame: FrameId) -> usize {
        self.0
            .frame_observers
            .borrow()
            .get(&frame)
            .map_or(0, Vec::len)
    }

    /// Drops everything held for `frame`: its chooser resolves with no port and its
    /// observers stop receiving events.
    pub fn frame_destroyed(&self, frame: FrameId) {
        let session = self.0.sessions.borrow_mut().remove(&frame);
        drop(session);

        let ids = self.0.frame_observers.borrow_mut().remove(&frame);
        for id in ids.into_iter().flatten() {
            self.0.observers.remove(id);
        }
    }
}

impl SerialDelegateInner {
    fn forget_resolved_session(&self, frame: FrameId) {
        let session = {
            let mut sessions = self.sessions.borrow_mut();
            let resolved = sessions
                .get(&frame)
                .is_some_and(|session| session.is_resolved());
            if resolved {
                sessions.remove(&frame)
            } else {
                None
            }
        };
        drop(session);
    }
}

impl SerialPortObserver for SerialDelegateInner {
    fn on_port_added(&self, port: &SerialPortInfo) {
        self.observers.notify(|observer| observer.on_port_added(port));
    }

    fn on_port_removed(&self, port: &SerialPortInfo) {
        self.observers
            .notify(|observer| observer.on_port_removed(port));
    }

    fn on_port_manager_connection_error(&self) {
        self.observers
            .notify(|observer| observer.on_port_manager_connection_error());
    }

    fn on_permission_revoked(&self, origin: &Origin, port: &SerialPortInfo) {
        self.observers
            .notify(|observer| observer.on_permission_revoked(origin, port));
    }

    fn on_registry_shutdown(&self) {
        self.port_observation.set(None);
        self.observers
            .notify(|observer| observer.on_registry_shutdown());
    }
}

impl Drop for SerialDelegateInner {
    fn drop(&mut self) {
        if let Some(observation) = self.port_observation.take() {
            self.registry.remove_observer(observation);
        }
        let sessions = std::mem::take(self.sessions.get_mut());
        drop(sessions);
    }
}
