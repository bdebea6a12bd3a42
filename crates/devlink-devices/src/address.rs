/*!
 * Device addresses.
 *
 * A device has two identities: a hardware address that survives
 * reconnection (a USB VID:PID) and a software address used to reach it
 * right now (a port name). Both are plain comparable values.
 */
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Marker for values usable as device addresses.
///
/// Implemented for every cloneable, comparable, printable type, so
/// `String` or `std::net::SocketAddr` work as addresses directly.
pub trait Address: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static {}

impl<T> Address for T where T: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static
{}

/// Name of an OS serial port, e.g. `/dev/ttyUSB0` or `COM3`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortName(String);

impl PortName {
    /// Create a port name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// The port name as passed to the OS
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PortName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// USB identity of a device: vendor id, product id and, when the device
/// reports one, its serial number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// USB serial number string
    pub serial: Option<String>,
}

impl UsbId {
    /// Create an identity from a VID:PID pair
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            serial: None,
        }
    }

    /// Attach a serial number, distinguishing identical devices
    pub fn with_serial<S: Into<String>>(mut self, serial: S) -> Self {
        self.serial = Some(serial.into());
        self
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)?;
        if let Some(serial) = &self.serial {
            write!(f, ":{}", serial)?;
        }
        Ok(())
    }
}

/// A hardware address together with the software address it currently
/// answers on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressPair<H, S> {
    /// Stable physical identity
    pub hardware: H,
    /// Current routable identity
    pub software: S,
}

impl<H: Address, S: Address> AddressPair<H, S> {
    /// Create a pair
    pub fn new(hardware: H, software: S) -> Self {
        Self { hardware, software }
    }
}

impl<H: Address, S: Address> fmt::Display for AddressPair<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.hardware, self.software)
    }
}
