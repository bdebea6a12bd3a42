/*!
 * Buffered transports.
 *
 * A [`BufferedTransport`] turns an event-driven byte stream into a pull
 * API. While connected, a background task drains the link into a
 * [`ReceiveBuffer`]; callers block only inside `read_exact`/`read_until`.
 */
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use devlink_core::logging::component_span;
use devlink_core::types::Id;

use crate::buffer::{CloseReason, ReceiveBuffer};
use crate::device::{DeviceError, Result};
use crate::link::{is_channel_gone, open_error, Link, LinkReader, LinkWriter};
use crate::registry::SharedConnectionRegistry;

/// Successful outcome of [`Transport::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectOutcome {
    /// The channel was opened by this call
    ConnectedSuccessfully,
    /// The channel was already open
    AlreadyConnected,
}

/// Successful outcome of [`Transport::disconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectOutcome {
    /// The channel was released by this call
    DisconnectedSuccessfully,
    /// The channel was not open
    AlreadyDisconnected,
    /// This transport let go, but other owners still hold the address
    Ambiguous {
        /// Owners still holding the address
        remaining_owners: usize,
    },
}

/// State of a transport's background read loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadLoopState {
    /// No loop is running
    Idle,
    /// The loop is draining the link
    Reading,
    /// The loop halted on a read fault
    Stopped,
}

/// A byte-stream channel to one device.
///
/// Every expected failure is returned as a [`DeviceError`]; nothing here
/// panics on device conditions. At most one reader should be outstanding at
/// a time; concurrent readers race for bytes.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Printable address of the channel
    fn address(&self) -> String;

    /// Whether the channel is open and its read loop healthy
    fn is_connected(&self) -> bool;

    /// Number of received bytes waiting to be read
    fn buffered(&self) -> usize;

    /// Open the channel and start the read loop
    async fn connect(&self) -> Result<ConnectOutcome>;

    /// Stop the read loop and release the channel
    async fn disconnect(&self) -> Result<DisconnectOutcome>;

    /// Write bytes to the device
    async fn transmit(&self, bytes: &[u8]) -> Result<()>;

    /// Wait for and remove exactly `count` received bytes
    async fn read_exact(&self, count: usize, cancel: &CancellationToken) -> Result<Bytes>;

    /// Wait for and remove received bytes up to and including `terminator`
    async fn read_until(&self, terminator: u8, cancel: &CancellationToken) -> Result<Bytes>;
}

struct Session {
    writer: Box<dyn LinkWriter>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type SharedState = Arc<StdMutex<ReadLoopState>>;

fn set_state(state: &SharedState, next: ReadLoopState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// The transport implementation: a link, a receive buffer and a read loop
pub struct BufferedTransport<L: Link> {
    link: L,
    id: Id,
    buffer: Arc<ReceiveBuffer>,
    session: Mutex<Option<Session>>,
    loop_state: SharedState,
    registry: Option<SharedConnectionRegistry>,
}

impl<L: Link> fmt::Debug for BufferedTransport<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedTransport")
            .field("link", &self.link)
            .field("id", &self.id)
            .field("connected", &self.buffer.is_open())
            .field("buffered", &self.buffer.len())
            .field("loop_state", &self.read_loop_state())
            .finish()
    }
}

impl<L: Link> BufferedTransport<L> {
    /// Create a disconnected transport over `link`
    pub fn new(link: L) -> Self {
        Self {
            link,
            id: Id::new(),
            buffer: Arc::new(ReceiveBuffer::closed(CloseReason::Disconnected)),
            session: Mutex::new(None),
            loop_state: Arc::new(StdMutex::new(ReadLoopState::Idle)),
            registry: None,
        }
    }

    /// Create a transport that records its hold on the address in `registry`
    pub fn with_registry(link: L, registry: SharedConnectionRegistry) -> Self {
        let mut transport = Self::new(link);
        transport.registry = Some(registry);
        transport
    }

    /// Owner identity used in the connection registry
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The underlying link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The receive buffer fed by the read loop
    pub fn buffer(&self) -> &Arc<ReceiveBuffer> {
        &self.buffer
    }

    /// Current state of the background read loop
    pub fn read_loop_state(&self) -> ReadLoopState {
        *self.loop_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, address: &str) -> usize {
        self.registry
            .as_ref()
            .map_or(0, |registry| registry.registry().release(address, &self.id))
    }

    async fn teardown(&self, session: Session) -> std::io::Result<()> {
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            if e.is_panic() {
                warn!("Read loop for {} panicked", self.link.address());
            }
        }
        let mut writer = session.writer;
        writer.close().await
    }
}

#[async_trait]
impl<L: Link> Transport for BufferedTransport<L> {
    fn address(&self) -> String {
        self.link.address()
    }

    fn is_connected(&self) -> bool {
        self.buffer.is_open()
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn connect(&self) -> Result<ConnectOutcome> {
        let address = self.link.address();
        let mut session = self.session.lock().await;

        if session.is_some() && self.buffer.is_open() {
            debug!("Transport {} already connected", address);
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        // A session whose loop died on a read fault is replaced.
        if let Some(stale) = session.take() {
            debug!("Replacing lost session on {}", address);
            if let Err(e) = self.teardown(stale).await {
                warn!("Failed to close lost session on {}: {}", address, e);
            }
            self.release(&address);
        }

        let (reader, writer) = self
            .link
            .open()
            .await
            .map_err(|e| open_error(&address, e))?;

        self.buffer.clear();
        self.buffer.reopen();
        set_state(&self.loop_state, ReadLoopState::Reading);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            read_loop(
                reader,
                self.buffer.clone(),
                cancel.clone(),
                self.loop_state.clone(),
                address.clone(),
            )
            .instrument(component_span("transport", Some(&address))),
        );

        *session = Some(Session {
            writer,
            cancel,
            task,
        });

        if let Some(registry) = &self.registry {
            registry.registry().acquire(&address, &self.id);
        }

        info!("Connected to {}", address);
        Ok(ConnectOutcome::ConnectedSuccessfully)
    }

    async fn disconnect(&self) -> Result<DisconnectOutcome> {
        let address = self.link.address();
        // Held until the buffer is closed so a concurrent connect cannot
        // slip a new session in underneath the teardown.
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            debug!("Transport {} already disconnected", address);
            return Ok(DisconnectOutcome::AlreadyDisconnected);
        };

        let closed = self.teardown(session).await;
        self.buffer.close(CloseReason::Disconnected);
        set_state(&self.loop_state, ReadLoopState::Idle);
        let remaining = self.release(&address);
        drop(guard);

        closed.map_err(|e| DeviceError::DisconnectionFailed(format!("{}: {}", address, e)))?;

        if remaining > 0 {
            info!("Released {}, still held by {} other owner(s)", address, remaining);
            return Ok(DisconnectOutcome::Ambiguous {
                remaining_owners: remaining,
            });
        }

        info!("Disconnected from {}", address);
        Ok(DisconnectOutcome::DisconnectedSuccessfully)
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(session) = session.as_mut() else {
            return Err(DeviceError::NotConnected);
        };
        if let Some(reason) = self.buffer.close_reason() {
            return Err(reason.to_error());
        }

        session.writer.write_all(bytes).await.map_err(|e| {
            DeviceError::DeviceWriteFailed(format!("{}: {}", self.link.address(), e))
        })?;
        debug!("Transmitted {} bytes to {}", bytes.len(), self.link.address());
        Ok(())
    }

    async fn read_exact(&self, count: usize, cancel: &CancellationToken) -> Result<Bytes> {
        self.buffer.read_exact(count, cancel).await
    }

    async fn read_until(&self, terminator: u8, cancel: &CancellationToken) -> Result<Bytes> {
        self.buffer.read_until(terminator, cancel).await
    }
}

impl<L: Link> Drop for BufferedTransport<L> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            let address = self.link.address();
            self.release(&address);
        }
    }
}

async fn read_loop(
    mut reader: Box<dyn LinkReader>,
    buffer: Arc<ReceiveBuffer>,
    cancel: CancellationToken,
    state: SharedState,
    address: String,
) {
    debug!("Read loop started");
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                set_state(&state, ReadLoopState::Idle);
                debug!("Read loop cancelled");
                return;
            }
            result = reader.read() => result,
        };

        match result {
            Ok(bytes) if bytes.is_empty() => tokio::task::yield_now().await,
            Ok(bytes) => {
                debug!("Received {} bytes", bytes.len());
                buffer.append(&bytes);
            }
            Err(e) => {
                error!("Read from {} failed: {}", address, e);
                let cause = if is_channel_gone(e.kind()) {
                    "channel closed"
                } else {
                    "read fault"
                };
                set_state(&state, ReadLoopState::Stopped);
                let detail = format!("{}: {} ({})", address, e, cause);
                buffer.close(CloseReason::ConnectionLost(detail));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use crate::link::memory::simulated;

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (link, device) = simulated("sim0");
        let transport = BufferedTransport::new(link);
        assert_eq!(transport.read_loop_state(), ReadLoopState::Idle);

        assert_eq!(transport.connect().await.unwrap(), ConnectOutcome::ConnectedSuccessfully);
        assert_eq!(transport.connect().await.unwrap(), ConnectOutcome::AlreadyConnected);
        assert_eq!(device.open_count(), 1);
        assert_eq!(transport.read_loop_state(), ReadLoopState::Reading);

        assert_eq!(
            transport.disconnect().await.unwrap(),
            DisconnectOutcome::DisconnectedSuccessfully
        );
        assert_eq!(
            transport.disconnect().await.unwrap(),
            DisconnectOutcome::AlreadyDisconnected
        );
        assert_eq!(transport.read_loop_state(), ReadLoopState::Idle);
        assert!(!device.is_open());
    }

    #[tokio::test]
    async fn test_access_denied_is_distinct() {
        let (link, device) = simulated("sim0");
        let transport = BufferedTransport::new(link);

        device.refuse_open(Some(io::ErrorKind::PermissionDenied));
        assert!(matches!(transport.connect().await, Err(DeviceError::AccessDenied(_))));

        device.refuse_open(Some(io::ErrorKind::NotFound));
        assert!(matches!(transport.connect().await, Err(DeviceError::ConnectionFailed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_transmit_and_read() {
        let (link, device) = simulated("sim0");
        device.set_responder(|req| (req == b"?").then(|| b"42\n".to_vec()));
        let transport = BufferedTransport::new(link);
        transport.connect().await.unwrap();

        transport.transmit(b"?").await.unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(
            transport.read_until(b'\n', &cancel).await.unwrap(),
            Bytes::from_static(b"42\n")
        );
        assert_eq!(device.transmitted(), b"?");
    }

    #[tokio::test]
    async fn test_read_fault_becomes_connection_lost() {
        let (link, device) = simulated("sim0");
        let transport = BufferedTransport::new(link);
        transport.connect().await.unwrap();

        device.feed(b"ab");
        device.inject_read_error(io::ErrorKind::ConnectionReset);

        let cancel = CancellationToken::new();
        assert_eq!(transport.read_exact(2, &cancel).await.unwrap(), Bytes::from_static(b"ab"));
        assert!(matches!(
            transport.read_exact(1, &cancel).await,
            Err(DeviceError::ConnectionLost(_))
        ));
        assert!(!transport.is_connected());
        assert_eq!(transport.read_loop_state(), ReadLoopState::Stopped);
        assert!(matches!(transport.transmit(b"x").await, Err(DeviceError::ConnectionLost(_))));

        // Reconnecting replaces the dead session.
        assert_eq!(transport.connect().await.unwrap(), ConnectOutcome::ConnectedSuccessfully);
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test]
    async fn test_any_read_fault_is_connection_lost() {
        let (link, device) = simulated("sim0");
        let transport = BufferedTransport::new(link);
        transport.connect().await.unwrap();

        device.inject_read_error(io::ErrorKind::InvalidData);
        let cancel = CancellationToken::new();
        let err = transport.read_until(b'\n', &cancel).await.unwrap_err();
        assert!(matches!(&err, DeviceError::ConnectionLost(msg) if msg.contains("read fault")));
        assert!(err.is_disconnect());
        assert_eq!(transport.read_loop_state(), ReadLoopState::Stopped);
    }

    #[tokio::test]
    async fn test_disconnect_wakes_pending_reader() {
        let (link, _device) = simulated("sim0");
        let transport = Arc::new(BufferedTransport::new(link));
        transport.connect().await.unwrap();

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                transport.read_exact(4, &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.disconnect().await.unwrap();

        assert!(matches!(reader.await.unwrap(), Err(DeviceError::NotConnected)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_connect_and_disconnect_stay_consistent() {
        let (link, device) = simulated("sim0");
        let transport = Arc::new(BufferedTransport::new(link));

        for _ in 0..200 {
            let connector = {
                let transport = transport.clone();
                tokio::spawn(async move { transport.connect().await })
            };
            let disconnector = {
                let transport = transport.clone();
                tokio::spawn(async move { transport.disconnect().await })
            };
            connector.await.unwrap().unwrap();
            disconnector.await.unwrap().unwrap();

            // Whichever call ran last decides the state, and the buffer and
            // read loop must agree with it.
            let has_session = transport.session.lock().await.is_some();
            assert_eq!(transport.is_connected(), has_session);
            let expected = if has_session {
                ReadLoopState::Reading
            } else {
                ReadLoopState::Idle
            };
            assert_eq!(transport.read_loop_state(), expected);
            assert_eq!(device.is_open(), has_session);
        }
    }

    #[tokio::test]
    async fn test_shared_address_disconnect_is_ambiguous() {
        let registry = SharedConnectionRegistry::new();
        let (first_link, _first_device) = simulated("sim0");
        let (second_link, _second_device) = simulated("sim0");
        let first = BufferedTransport::with_registry(first_link, registry.clone());
        let second = BufferedTransport::with_registry(second_link, registry.clone());

        first.connect().await.unwrap();
        second.connect().await.unwrap();
        assert_eq!(registry.registry().holders("sim0"), 2);

        assert_eq!(
            first.disconnect().await.unwrap(),
            DisconnectOutcome::Ambiguous { remaining_owners: 1 }
        );
        assert_eq!(
            second.disconnect().await.unwrap(),
            DisconnectOutcome::DisconnectedSuccessfully
        );
        assert!(!registry.registry().is_held("sim0"));
    }

    #[tokio::test]
    async fn test_drop_releases_registry() {
        let registry = SharedConnectionRegistry::new();
        let (link, _device) = simulated("sim0");
        {
            let transport = BufferedTransport::with_registry(link, registry.clone());
            transport.connect().await.unwrap();
            assert!(registry.registry().is_held("sim0"));
        }
        assert!(!registry.registry().is_held("sim0"));
    }
}
