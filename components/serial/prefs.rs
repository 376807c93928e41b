/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Preferences controlling the serial permission broker. They are read from the same
//! kind of JSON preferences document as the rest of the engine's preferences; unknown
//! keys are ignored and missing keys take their default.

use serde::{Deserialize, Serialize};
use serial_traits::blocklist::SerialBlocklist;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct SerialPreferences {
    /// Whether pages may ask for serial ports at all.
    pub dom_serial_enabled: bool,
    /// Ignore the serial blocklist. Only meant for testing devices that are on it.
    pub dom_serial_blocklist_disabled: bool,
    /// Remember grants for ports with a stable identity across reconnections.
    pub dom_serial_persistent_permissions_enabled: bool,
    /// Extra lines in blocklist syntax, appended to the built-in blocklist.
    pub dom_serial_blocklist_additions: Vec<String>,
}

impl Default for SerialPreferences {
    fn default() -> Self {
        SerialPreferences {
            dom_serial_enabled: true,
            dom_serial_blocklist_disabled: false,
            dom_serial_persistent_permissions_enabled: false,
            dom_serial_blocklist_additions: Vec::new(),
        }
    }
}

impl SerialPreferences {
    pub fn from_json_str(json: &str) -> Result<SerialPreferences, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The blocklist these preferences ask for, or `None` when it is disabled.
    pub fn blocklist(&self) -> Option<SerialBlocklist> {
        if self.dom_serial_blocklist_disabled {
            return None;
        }
        let mut blocklist = SerialBlocklist::builtin();
        if !self.dom_serial_blocklist_additions.is_empty() {
            blocklist.extend_from_str(&self.dom_serial_blocklist_additions.join("\n"));
        }
        Some(blocklist)
    }
}
