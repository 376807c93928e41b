/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serial_traits::SerialPortObserver;

/// Identifies one registration in an [`ObserverList`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObserverId(u64);

/// A list of observers that does not keep them alive. Notification works on a snapshot,
/// so observers may add or remove registrations, or go away, while being notified.
#[derive(Default)]
pub(crate) struct ObserverList {
    next_id: Cell<u64>,
    observers: RefCell<Vec<(ObserverId, Weak<dyn SerialPortObserver>)>>,
}

impl ObserverList {
    pub(crate) fn add(&self, observer: Weak<dyn SerialPortObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.observers.borrow_mut().push((id, observer));
        id
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    pub(crate) fn contains(&self, id: ObserverId) -> bool {
        self.observers
            .borrow()
            .iter()
            .any(|(observer_id, _)| *observer_id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.borrow().len()
    }

    fn snapshot(&self) -> Vec<(ObserverId, Rc<dyn SerialPortObserver>)> {
        let mut observers = self.observers.borrow_mut();
        observers.retain(|(_, observer)| observer.strong_count() > 0);
        observers
            .iter()
            .filter_map(|(id, observer)| observer.upgrade().map(|observer| (*id, observer)))
            .collect()
    }

    /// Calls `f` for every live observer that is still registered at the moment its
    /// turn comes.
    pub(crate) fn notify(&self, f: impl Fn(&dyn SerialPortObserver)) {
        for (id, observer) in self.snapshot() {
            if self.contains(id) {
                f(&*observer);
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.observers.borrow_mut().clear();
    }
}
