/*!
 * Device discovery for devlink.
 *
 * A [`Scanner`] enumerates the devices reachable right now as index-aligned
 * hardware and software address lists. How it finds them (OS port
 * enumeration, a registry query, a network probe) is its own business; the
 * watcher only diffs successive results.
 */
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::address::{Address, AddressPair};
use crate::device::{DeviceError, Result};

/// One scan: the i-th hardware address answers on the i-th software address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult<H, S> {
    hardware: Vec<H>,
    software: Vec<S>,
}

impl<H: Address, S: Address> ScanResult<H, S> {
    /// Build a result from aligned lists; lists of different lengths are
    /// rejected
    pub fn new(hardware: Vec<H>, software: Vec<S>) -> Result<Self> {
        if hardware.len() != software.len() {
            return Err(DeviceError::ScanFailed(format!(
                "scan returned {} hardware and {} software addresses",
                hardware.len(),
                software.len()
            )));
        }
        Ok(Self { hardware, software })
    }

    /// An empty result
    pub fn empty() -> Self {
        Self {
            hardware: Vec::new(),
            software: Vec::new(),
        }
    }

    /// Build a result from address pairs
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = AddressPair<H, S>>,
    {
        let (hardware, software) = pairs
            .into_iter()
            .map(|pair| (pair.hardware, pair.software))
            .unzip();
        Self { hardware, software }
    }

    /// Hardware addresses in scan order
    pub fn hardware(&self) -> &[H] {
        &self.hardware
    }

    /// Software addresses in scan order
    pub fn software(&self) -> &[S] {
        &self.software
    }

    /// Number of devices found
    pub fn len(&self) -> usize {
        self.hardware.len()
    }

    /// Whether no device was found
    pub fn is_empty(&self) -> bool {
        self.hardware.is_empty()
    }

    /// Split into the two aligned lists
    pub fn into_parts(self) -> (Vec<H>, Vec<S>) {
        (self.hardware, self.software)
    }
}

/// Enumerates currently reachable devices
#[async_trait]
pub trait Scanner: Send + Sync + 'static {
    /// Stable physical identity
    type Hardware: Address;
    /// Current routable identity
    type Software: Address;

    /// Enumerate devices. Called once per watcher poll.
    async fn scan(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ScanResult<Self::Hardware, Self::Software>>;
}

#[cfg(feature = "serial")]
pub use serial_scan::SerialPortScanner;

#[cfg(feature = "serial")]
mod serial_scan {
    use super::*;
    use crate::address::{PortName, UsbId};

    /// Finds USB serial adapters: hardware is the USB identity, software the
    /// port name. Ports without USB information are skipped.
    #[derive(Debug, Clone, Default)]
    pub struct SerialPortScanner;

    impl SerialPortScanner {
        /// Create a scanner
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl Scanner for SerialPortScanner {
        type Hardware = UsbId;
        type Software = PortName;

        async fn scan(&self, cancel: &CancellationToken) -> Result<ScanResult<UsbId, PortName>> {
            let ports = tokio::select! {
                ports = tokio::task::spawn_blocking(serialport::available_ports) => ports,
                _ = cancel.cancelled() => return Err(DeviceError::DeviceTimeout),
            };
            let ports = ports
                .map_err(|e| DeviceError::ScanFailed(e.to_string()))?
                .map_err(|e| DeviceError::ScanFailed(e.to_string()))?;

            Ok(ScanResult::from_pairs(ports.into_iter().filter_map(|port| {
                // macOS lists each device twice; only the cu.* node is usable
                // for outgoing connections.
                if cfg!(target_os = "macos") && port.port_name.starts_with("/dev/tty.") {
                    return None;
                }
                match port.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        let mut id = UsbId::new(info.vid, info.pid);
                        if let Some(serial) = info.serial_number {
                            id = id.with_serial(serial);
                        }
                        Some(AddressPair::new(id, PortName::new(port.port_name)))
                    }
                    _ => None,
                }
            })))
        }
    }
}
