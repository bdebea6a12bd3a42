/*!
 * Device outcomes and the device facade.
 *
 * Every device-facing operation returns `Result<_, DeviceError>`; the
 * variants of [`DeviceError`] are the complete set of run-time failure
 * kinds a caller has to handle.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devlink_core::error::Error as CoreError;
use devlink_core::utils::with_retry;

use crate::address::Address;
use crate::dispatcher::Dispatcher;
use crate::encoder::DecodeError;
use crate::transport::{ConnectOutcome, DisconnectOutcome, Transport};
use crate::watcher::WatcherEvent;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The channel could not be opened (device absent, bad settings, ...)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The device is present but the OS refused access to it
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The transport is not connected
    #[error("Device not connected")]
    NotConnected,

    /// The connection dropped while it was in use
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The channel could not be released cleanly
    #[error("Disconnection failed: {0}")]
    DisconnectionFailed(String),

    /// Writing to the device failed
    #[error("Device write failed: {0}")]
    DeviceWriteFailed(String),

    /// Reading from the device failed
    #[error("Device read failed: {0}")]
    DeviceDataReadFailed(String),

    /// A by-length read was cancelled before enough bytes arrived
    #[error("Not enough data available: requested {requested}, buffered {available}")]
    NotEnoughDataAvailable {
        /// Number of bytes the caller asked for
        requested: usize,
        /// Number of bytes buffered when the read gave up
        available: usize,
    },

    /// A read was cancelled before its terminator arrived
    #[error("Device timeout")]
    DeviceTimeout,

    /// The response bytes could not be decoded
    #[error("Decode failed: {0}")]
    DecodeFailed(#[from] DecodeError),

    /// The device scan collaborator failed
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// A transaction, transport or watcher was configured incorrectly
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl DeviceError {
    /// Whether the error came from cancellation or a timeout, so that the
    /// operation can be retried without losing buffered data
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DeviceError::DeviceTimeout
                | DeviceError::NotEnoughDataAvailable { .. }
                | DeviceError::Core(CoreError::Timeout(_))
        )
    }

    /// Whether the error means the link is gone and must be reconnected
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DeviceError::NotConnected
                | DeviceError::ConnectionLost(_)
                | DeviceError::DeviceDataReadFailed(_)
        )
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// The device is disconnected
    Disconnected,
    /// The device is connected
    Connected,
}

/// A device known by its hardware address and reached through a transport.
///
/// The device follows watcher events: it connects when its hardware address
/// is reported added and disconnects when it is reported removed.
#[derive(Debug)]
pub struct Device<H: Address, T: Transport> {
    hardware: H,
    dispatcher: Dispatcher<T>,
}

impl<H: Address, T: Transport + 'static> Device<H, T> {
    /// Create a device bound to a transport
    pub fn new(hardware: H, transport: Arc<T>) -> Self {
        Self {
            hardware,
            dispatcher: Dispatcher::new(transport),
        }
    }

    /// Create a device from an existing dispatcher
    pub fn with_dispatcher(hardware: H, dispatcher: Dispatcher<T>) -> Self {
        Self {
            hardware,
            dispatcher,
        }
    }

    /// The stable hardware address
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<T> {
        self.dispatcher.transport()
    }

    /// The dispatcher used to run transactions against this device
    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    /// Current connection state
    pub fn state(&self) -> DeviceState {
        if self.transport().is_connected() {
            DeviceState::Connected
        } else {
            DeviceState::Disconnected
        }
    }

    /// Connect the transport
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        self.transport().connect().await
    }

    /// Connect the transport, retrying up to `retries` more times. Each
    /// attempt is bounded by `attempt_timeout`; the last failure is returned.
    pub async fn connect_with_retry(
        &self,
        retries: usize,
        attempt_timeout: Duration,
    ) -> Result<ConnectOutcome> {
        with_retry(attempt_timeout, retries, move || self.connect()).await
    }

    /// Disconnect the transport
    pub async fn disconnect(&self) -> Result<DisconnectOutcome> {
        self.transport().disconnect().await
    }

    /// React to a watcher event. Events for other devices are ignored and
    /// yield `Ok(None)`.
    pub async fn handle_event<S: Address>(
        &self,
        event: &WatcherEvent<H, S>,
    ) -> Result<Option<DeviceState>> {
        if event.pair().hardware != self.hardware {
            return Ok(None);
        }

        match event {
            WatcherEvent::Added { device, .. } => {
                info!("Device {} appeared at {}, connecting", self.hardware, device.software);
                self.connect().await?;
            }
            WatcherEvent::Removed { device, .. } => {
                info!("Device {} left {}, disconnecting", self.hardware, device.software);
                self.disconnect().await?;
            }
        }

        Ok(Some(self.state()))
    }

    /// Follow a watcher's event stream until `cancel` fires or the watcher
    /// is dropped. Failures are logged and do not stop the task.
    pub fn follow<S: Address>(
        self: Arc<Self>,
        mut events: broadcast::Receiver<WatcherEvent<H, S>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            warn!("Device {} failed to follow {:?}: {}", self.hardware, event, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Device {} missed {} watcher events", self.hardware, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Device {} stopped following watcher", self.hardware);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressPair, PortName, UsbId};
    use crate::link::memory::{simulated, MemoryLink, SimulatedDevice};
    use crate::transport::BufferedTransport;

    type SimDevice = Device<UsbId, BufferedTransport<MemoryLink>>;

    fn device() -> (SimDevice, SimulatedDevice) {
        let (link, sim) = simulated("/dev/ttyACM0");
        let transport = Arc::new(BufferedTransport::new(link));
        (Device::new(UsbId::new(0x2341, 0x0043), transport), sim)
    }

    #[test]
    fn test_error_classification() {
        assert!(DeviceError::DeviceTimeout.is_timeout());
        assert!(DeviceError::NotEnoughDataAvailable { requested: 8, available: 4 }.is_timeout());
        assert!(DeviceError::ConnectionLost("gone".into()).is_disconnect());
        assert!(!DeviceError::AccessDenied("busy".into()).is_disconnect());
    }

    #[tokio::test]
    async fn test_device_follows_add_and_remove() {
        let (device, _sim) = device();
        assert_eq!(device.state(), DeviceState::Disconnected);

        let pair = AddressPair::new(UsbId::new(0x2341, 0x0043), PortName::new("/dev/ttyACM0"));
        let added = WatcherEvent::added(pair.clone());
        assert_eq!(device.handle_event(&added).await.unwrap(), Some(DeviceState::Connected));

        let removed = WatcherEvent::removed(pair);
        assert_eq!(
            device.handle_event(&removed).await.unwrap(),
            Some(DeviceState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_connect_with_retry() {
        let (device, sim) = device();

        sim.refuse_open(Some(std::io::ErrorKind::NotFound));
        let err = device
            .connect_with_retry(2, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ConnectionFailed(_)));
        assert_eq!(device.state(), DeviceState::Disconnected);

        sim.refuse_open(None);
        assert_eq!(
            device
                .connect_with_retry(2, Duration::from_millis(100))
                .await
                .unwrap(),
            ConnectOutcome::ConnectedSuccessfully
        );
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_core_timeout_counts_as_timeout() {
        assert!(DeviceError::from(CoreError::timeout("slow open")).is_timeout());
        assert!(!DeviceError::from(CoreError::other("boom")).is_timeout());
    }

    #[tokio::test]
    async fn test_device_ignores_other_hardware() {
        let (device, _sim) = device();
        let other = AddressPair::new(UsbId::new(0x0403, 0x6001), PortName::new("/dev/ttyUSB0"));
        assert_eq!(device.handle_event(&WatcherEvent::added(other)).await.unwrap(), None);
        assert_eq!(device.state(), DeviceState::Disconnected);
    }
}
