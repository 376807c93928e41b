/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The serial port permission broker.
//!
//! [`PortRegistry`] tracks the ports reported by the platform and the origins allowed to
//! use them. [`ChooserSession`] runs a single "pick a port" interaction through the
//! embedder's [`SerialChooserDelegate`]. [`SerialDelegate`] is what the engine talks to:
//! it keeps one chooser per frame, answers permission checks and forwards port changes
//! to observers.

#![deny(unsafe_code)]

mod chooser;
mod delegate;
mod observer;
pub mod permission_store;
pub mod prefs;
mod registry;
#[cfg(feature = "serial-test")]
pub mod test;

pub use chooser::{
    ChooserSession, ChooserSessionId, ChooserState, SerialChooserCallback,
    SerialChooserDelegate, SerialPortSelectionRequest,
};
pub use delegate::{
    DefaultSerialPermissionPolicy, SerialChooserHandle, SerialDelegate, SerialPermissionPolicy,
};
pub use observer::ObserverId;
pub use registry::PortRegistry;
pub use serial_traits::*;
