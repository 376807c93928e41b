/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Types shared between the serial permission broker, the platform serial service that
//! enumerates ports, and the embedder that renders the port chooser.

#![deny(unsafe_code)]

pub mod blocklist;

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use url::Origin;
use uuid::Uuid;

/// The Bluetooth Serial Port Profile service class. Ports advertising it are always
/// allowed in a chooser, whatever service classes the page asked for.
pub const SERIAL_PORT_PROFILE_UUID: Uuid =
    Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// An opaque token identifying a port for as long as the platform reports it. Tokens are
/// never reused, so a token that refers to a removed port stays dead.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct SerialPortId(Uuid);

impl SerialPortId {
    pub fn new() -> SerialPortId {
        SerialPortId(Uuid::new_v4())
    }
}

impl Default for SerialPortId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SerialPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for SerialPortId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SerialPortId)
    }
}

/// A serial port as reported by the platform.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SerialPortInfo {
    pub id: SerialPortId,
    /// The OS device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: PathBuf,
    pub display_name: Option<String>,
    /// An identifier that stays stable across reboots and re-plugging, when the
    /// platform can provide one.
    pub persistent_id: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
    pub bluetooth_service_class_id: Option<Uuid>,
}

impl SerialPortInfo {
    /// A port at `path` with a fresh id and no other attributes.
    pub fn new(path: impl Into<PathBuf>) -> SerialPortInfo {
        SerialPortInfo {
            id: SerialPortId::new(),
            path: path.into(),
            display_name: None,
            persistent_id: None,
            vendor_id: None,
            product_id: None,
            serial_number: None,
            bluetooth_service_class_id: None,
        }
    }

    /// Whether a grant for this port may outlive the current connection to the platform.
    ///
    /// Without a display name the path would have to be shown instead, and paths such as
    /// `ttyUSB0` are handed to whichever device is plugged in next.
    pub fn can_store_persistent_entry(&self) -> bool {
        let has_display_name = self.display_name.as_ref().is_some_and(|n| !n.is_empty());
        let has_persistent_id = self.persistent_id.as_ref().is_some_and(|i| !i.is_empty());
        has_display_name && has_persistent_id
    }

    /// The label a chooser should show for this port.
    pub fn display_label(&self) -> String {
        match self.display_name {
            Some(ref name) if !name.is_empty() => name.clone(),
            _ => self
                .path
                .file_name()
                .unwrap_or(self.path.as_os_str())
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// One entry of the filter list passed to `requestPort()`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SerialPortFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub bluetooth_service_class_id: Option<Uuid>,
}

impl SerialPortFilter {
    pub fn vendor(vendor_id: u16) -> SerialPortFilter {
        SerialPortFilter {
            vendor_id: Some(vendor_id),
            ..Default::default()
        }
    }

    pub fn vendor_and_product(vendor_id: u16, product_id: u16) -> SerialPortFilter {
        SerialPortFilter {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Default::default()
        }
    }

    pub fn bluetooth_service_class(id: Uuid) -> SerialPortFilter {
        SerialPortFilter {
            bluetooth_service_class_id: Some(id),
            ..Default::default()
        }
    }

    /// A product id only has meaning within a vendor's id space.
    pub fn is_valid(&self) -> bool {
        !(self.product_id.is_some() && self.vendor_id.is_none())
    }

    /// Every attribute present in the filter must equal the port's. Invalid filters
    /// match nothing.
    pub fn matches(&self, port: &SerialPortInfo) -> bool {
        if !self.is_valid() {
            return false;
        }
        if self.vendor_id.is_some() && self.vendor_id != port.vendor_id {
            return false;
        }
        if self.product_id.is_some() && self.product_id != port.product_id {
            return false;
        }
        if self.bluetooth_service_class_id.is_some() &&
            self.bluetooth_service_class_id != port.bluetooth_service_class_id
        {
            return false;
        }
        true
    }
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a frame for as long as it lives.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn next() -> FrameId {
        FrameId(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The frame on whose behalf a request is made, along with the origin that grants are
/// recorded against.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerialFrame {
    pub id: FrameId,
    pub origin: Origin,
}

impl SerialFrame {
    pub fn new(id: FrameId, origin: Origin) -> SerialFrame {
        SerialFrame { id, origin }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SerialError {
    /// The connection to the platform serial service is gone.
    Disconnected,
    NotSupported,
    Type(String),
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialError::Disconnected => write!(f, "serial port manager disconnected"),
            SerialError::NotSupported => write!(f, "serial ports are not supported"),
            SerialError::Type(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SerialError {}

/// Messages pushed by the platform serial service to its client.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum SerialPortManagerEvent {
    PortAdded(SerialPortInfo),
    PortRemoved(SerialPortInfo),
    /// The service is going away. Dropping every sender has the same effect.
    Disconnected,
}

/// A live connection to the platform serial service.
pub trait SerialPortManager {
    /// Registers the channel that receives hot-plug events from now on.
    fn set_client(&self, client: Sender<SerialPortManagerEvent>) -> Result<(), SerialError>;

    /// The ports currently attached.
    fn get_devices(&self) -> Result<Vec<SerialPortInfo>, SerialError>;
}

/// The platform service that hands out [`SerialPortManager`] connections.
pub trait SerialDeviceService {
    fn bind_port_manager(&self) -> Result<Rc<dyn SerialPortManager>, SerialError>;
}

/// Receives port and permission changes. Every method has an empty default so observers
/// only implement what they care about.
pub trait SerialPortObserver {
    fn on_port_added(&self, _port: &SerialPortInfo) {}

    /// `port` is the last known state of a port that no longer exists.
    fn on_port_removed(&self, _port: &SerialPortInfo) {}

    fn on_port_manager_connection_error(&self) {}

    fn on_permission_revoked(&self, _origin: &Origin, _port: &SerialPortInfo) {}

    /// The registry is being destroyed and will send nothing more.
    fn on_registry_shutdown(&self) {}
}
