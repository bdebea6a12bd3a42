/*!
 * devlink Devices
 *
 * This crate provides buffered byte-stream transports, transaction
 * dispatch over pluggable encoders, and device discovery for the devlink
 * device-communication framework.
 */

#![warn(missing_docs)]

// Re-export core types
pub use devlink_core::prelude;

pub mod address;
pub mod buffer;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod encoder;
pub mod link;
pub mod protocols;
pub mod registry;
pub mod transaction;
pub mod transport;
pub mod watcher;

pub use address::{Address, AddressPair, PortName, UsbId};
pub use buffer::{CloseReason, ReceiveBuffer};
pub use device::{Device, DeviceError, DeviceState};
pub use discovery::{ScanResult, Scanner};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use encoder::{DecodeError, Encoder};
pub use link::memory::{simulated, MemoryLink, SimulatedDevice};
pub use link::Link;
pub use registry::{ConnectionRegistry, SharedConnectionRegistry};
pub use transaction::{Exchange, ReadStrategy, Transaction};
pub use transport::{BufferedTransport, ConnectOutcome, DisconnectOutcome, ReadLoopState, Transport};
pub use watcher::{Watcher, WatcherConfig, WatcherEvent, WatcherState};

#[cfg(feature = "serial")]
pub use discovery::SerialPortScanner;
#[cfg(feature = "serial")]
pub use link::serial::{SerialConfig, SerialLink};

/// devlink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), devlink_core::error::Error> {
    tracing::info!("devlink devices {} initialized (links: {:?})", VERSION, available_links());
    Ok(())
}

/// Names of the link kinds compiled into this build
pub fn available_links() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut links = vec!["memory"];

    #[cfg(feature = "serial")]
    links.push("serial");

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_links() {
        let links = available_links();
        assert!(links.contains(&"memory"));
        assert_eq!(links.contains(&"serial"), cfg!(feature = "serial"));
        assert!(init().is_ok());
    }
}
