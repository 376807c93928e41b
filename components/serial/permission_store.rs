/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use url::Origin;

/// Storage for grants that outlive the connection to the platform serial service. Entries
/// are keyed by the origin and the port's persistent id; how they are stored is up to
/// the embedder.
pub trait PersistentGrantStore {
    fn grant(&self, origin: &Origin, persistent_id: &str);
    fn revoke(&self, origin: &Origin, persistent_id: &str);
    fn contains(&self, origin: &Origin, persistent_id: &str) -> bool;
}

/// A [`PersistentGrantStore`] that lives as long as the process.
#[derive(Default)]
pub struct InMemoryGrantStore {
    entries: RefCell<HashMap<Origin, HashSet<String>>>,
}

impl InMemoryGrantStore {
    pub fn len(&self) -> usize {
        self.entries.borrow().values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentGrantStore for InMemoryGrantStore {
    fn grant(&self, origin: &Origin, persistent_id: &str) {
        self.entries
            .borrow_mut()
            .entry(origin.clone())
            .or_default()
            .insert(persistent_id.to_owned());
    }

    fn revoke(&self, origin: &Origin, persistent_id: &str) {
        let mut entries = self.entries.borrow_mut();
        if let Some(ids) = entries.get_mut(origin) {
            ids.remove(persistent_id);
            if ids.is_empty() {
                entries.remove(origin);
            }
        }
    }

    fn contains(&self, origin: &Origin, persistent_id: &str) -> bool {
        self.entries
            .borrow()
            .get(origin)
            .is_some_and(|ids| ids.contains(persistent_id))
    }
}
