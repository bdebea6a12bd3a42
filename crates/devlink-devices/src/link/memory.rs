/*!
 * In-process simulated device.
 *
 * [`simulated`] returns a [`MemoryLink`] to hand to a transport and a
 * [`SimulatedDevice`] handle that plays the device side: it feeds bytes,
 * records what the host transmitted, answers requests and can fail in the
 * ways real hardware does.
 */
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Link, LinkReader, LinkWriter};

type Inbound = Result<Bytes, io::ErrorKind>;
type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct Shared {
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    transmitted: Mutex<Vec<u8>>,
    refuse: Mutex<Option<io::ErrorKind>>,
    responder: Mutex<Option<Responder>>,
    opens: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn send(&self, item: Inbound) -> bool {
        match lock(&self.inbound).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// Create a linked pair of simulated link and device handle
pub fn simulated<S: Into<String>>(address: S) -> (MemoryLink, SimulatedDevice) {
    let shared = Arc::new(Shared::default());
    (
        MemoryLink {
            address: address.into(),
            shared: shared.clone(),
        },
        SimulatedDevice { shared },
    )
}

/// Host side of a simulated device
#[derive(Clone)]
pub struct MemoryLink {
    address: String,
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("address", &self.address)
            .field("opens", &self.shared.opens.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn open(&self) -> io::Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
        if let Some(kind) = *lock(&self.shared.refuse) {
            return Err(io::Error::new(kind, "simulated device refused open"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.inbound) = Some(tx);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated device {} opened", self.address);

        Ok((
            Box::new(MemoryReader { rx }),
            Box::new(MemoryWriter {
                shared: self.shared.clone(),
            }),
        ))
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl LinkReader for MemoryReader {
    async fn read(&mut self) -> io::Result<Bytes> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(kind)) => Err(io::Error::new(kind, "simulated read fault")),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated device went away",
            )),
        }
    }
}

struct MemoryWriter {
    shared: Arc<Shared>,
}

#[async_trait]
impl LinkWriter for MemoryWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if lock(&self.shared.inbound).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated device went away",
            ));
        }
        lock(&self.shared.transmitted).extend_from_slice(bytes);

        let responder = lock(&self.shared.responder).clone();
        if let Some(reply) = responder.and_then(|respond| respond(bytes)) {
            self.shared.send(Ok(Bytes::from(reply)));
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        lock(&self.shared.inbound).take();
        Ok(())
    }
}

/// Device side of a simulated link
#[derive(Clone)]
pub struct SimulatedDevice {
    shared: Arc<Shared>,
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("open", &self.is_open())
            .finish()
    }
}

impl SimulatedDevice {
    /// Deliver bytes to the host as one chunk. Returns `false` when the
    /// link is not open and the bytes were dropped.
    pub fn feed<B: AsRef<[u8]>>(&self, bytes: B) -> bool {
        self.shared.send(Ok(Bytes::copy_from_slice(bytes.as_ref())))
    }

    /// Deliver bytes to the host one byte per chunk
    pub fn feed_bytewise<B: AsRef<[u8]>>(&self, bytes: B) -> bool {
        bytes
            .as_ref()
            .iter()
            .all(|byte| self.shared.send(Ok(Bytes::copy_from_slice(&[*byte]))))
    }

    /// Make the host's next read fail with `kind`
    pub fn inject_read_error(&self, kind: io::ErrorKind) -> bool {
        self.shared.send(Err(kind))
    }

    /// Pull the plug: the open session sees its channel go away and later
    /// opens fail as if the port were absent
    pub fn unplug(&self) {
        *lock(&self.shared.refuse) = Some(io::ErrorKind::NotFound);
        lock(&self.shared.inbound).take();
    }

    /// Make the device openable again after [`unplug`](Self::unplug)
    pub fn plug_in(&self) {
        lock(&self.shared.refuse).take();
    }

    /// Refuse future opens with `kind`, or accept them again with `None`
    pub fn refuse_open(&self, kind: Option<io::ErrorKind>) {
        *lock(&self.shared.refuse) = kind;
    }

    /// Answer each host write with the bytes `respond` returns
    pub fn set_responder<F>(&self, respond: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *lock(&self.shared.responder) = Some(Arc::new(respond));
    }

    /// Everything the host has written so far
    pub fn transmitted(&self) -> Vec<u8> {
        lock(&self.shared.transmitted).clone()
    }

    /// Everything the host has written so far, clearing the record
    pub fn take_transmitted(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.shared.transmitted))
    }

    /// Whether a host session is currently open
    pub fn is_open(&self) -> bool {
        lock(&self.shared.inbound).is_some()
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_reaches_open_reader() {
        let (link, device) = simulated("sim0");
        assert!(!device.feed(b"dropped"));

        let (mut reader, _writer) = link.open().await.unwrap();
        assert!(device.feed(b"hi"));
        assert_eq!(reader.read().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test]
    async fn test_responder_answers_writes() {
        let (link, device) = simulated("sim0");
        device.set_responder(|req| Some(req.to_ascii_uppercase()));

        let (mut reader, mut writer) = link.open().await.unwrap();
        writer.write_all(b"ping").await.unwrap();
        assert_eq!(reader.read().await.unwrap(), Bytes::from_static(b"PING"));
        assert_eq!(device.take_transmitted(), b"ping");
        assert!(device.transmitted().is_empty());
    }

    #[tokio::test]
    async fn test_unplug_breaks_session_and_refuses_open() {
        let (link, device) = simulated("sim0");
        let (mut reader, mut writer) = link.open().await.unwrap();

        device.unplug();
        assert_eq!(reader.read().await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert!(writer.write_all(b"x").await.is_err());
        assert_eq!(link.open().await.err().map(|e| e.kind()), Some(io::ErrorKind::NotFound));

        device.plug_in();
        assert!(link.open().await.is_ok());
    }
}
