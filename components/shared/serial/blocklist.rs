/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashSet;

use log::warn;

use crate::SerialPortInfo;

const USB_PREFIX: &str = "usb";
const DEFAULT_BLOCKLIST: &str = include_str!("../../../resources/serial_blocklist.txt");

/// A set of USB vendor/product pairs that are never offered in a chooser and never
/// reported as granted. A blocklist that failed to parse blocks nothing.
#[derive(Clone, Debug, Default)]
pub struct SerialBlocklist(Option<HashSet<(u16, u16)>>);

impl SerialBlocklist {
    /// The blocklist shipped in `resources/serial_blocklist.txt`.
    pub fn builtin() -> SerialBlocklist {
        SerialBlocklist::parse(DEFAULT_BLOCKLIST)
    }

    pub fn parse(content: &str) -> SerialBlocklist {
        let entries = parse_blocklist(content);
        if entries.is_none() {
            warn!("Ignoring malformed serial blocklist");
        }
        SerialBlocklist(entries)
    }

    /// Parses `content` as extra entries and merges them in. A malformed addition is
    /// dropped as a whole and leaves the existing entries untouched.
    pub fn extend_from_str(&mut self, content: &str) {
        let Some(additions) = parse_blocklist(content) else {
            warn!("Ignoring malformed serial blocklist additions");
            return;
        };
        self.0.get_or_insert_with(HashSet::new).extend(additions);
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_excluded(&self, port: &SerialPortInfo) -> bool {
        let (Some(vendor_id), Some(product_id)) = (port.vendor_id, port.product_id) else {
            return false;
        };
        match self.0 {
            Some(ref entries) => entries.contains(&(vendor_id, product_id)),
            None => false,
        }
    }
}

fn parse_hex_id(word: &str) -> Option<u16> {
    if word.len() != 4 {
        return None;
    }
    u16::from_str_radix(word, 16).ok()
}

fn parse_blocklist(content: &str) -> Option<HashSet<(u16, u16)>> {
    let mut result = HashSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split(':');
        if words.next() != Some(USB_PREFIX) {
            return None;
        }
        let vendor_id = parse_hex_id(words.next()?)?;
        let product_id = parse_hex_id(words.next()?)?;
        if words.next().is_some() {
            return None;
        }
        result.insert((vendor_id, product_id));
    }
    Some(result)
}
