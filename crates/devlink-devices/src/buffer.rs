/*!
 * Receive buffer shared by a transport's read loop and its reader.
 *
 * One producer appends, one logical consumer removes. Bytes leave the
 * buffer in arrival order and exactly once. Waiting readers are woken by a
 * `Notify` on every append or close instead of polling.
 *
 * Two concurrent readers on the same buffer race for bytes; nothing here
 * arbitrates between them.
 */
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::device::{DeviceError, Result};

/// Why a buffer stopped accepting data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport was disconnected (or never connected)
    Disconnected,
    /// The read loop halted on a fault; the message carries the OS detail
    ConnectionLost(String),
}

impl CloseReason {
    /// The error a reader sees on a buffer closed for this reason
    pub fn to_error(&self) -> DeviceError {
        match self {
            CloseReason::Disconnected => DeviceError::NotConnected,
            CloseReason::ConnectionLost(msg) => DeviceError::ConnectionLost(msg.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: BytesMut,
    closed: Option<CloseReason>,
}

/// Thread-safe FIFO of received bytes
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ReceiveBuffer {
    /// Create an open, empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer that is closed until [`reopen`](Self::reopen)
    pub fn closed(reason: CloseReason) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: BytesMut::new(),
                closed: Some(reason),
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave `Inner` half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append received bytes and wake waiting readers
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            inner.data.extend_from_slice(bytes);
            trace!(appended = bytes.len(), buffered = inner.data.len(), "receive buffer");
        }
        self.notify.notify_waiters();
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the first `count` bytes, or everything if fewer are buffered
    pub fn peek(&self, count: usize) -> Bytes {
        let inner = self.lock();
        let end = count.min(inner.data.len());
        Bytes::copy_from_slice(&inner.data[..end])
    }

    /// Remove the first `count` bytes if that many are buffered
    pub fn consume(&self, count: usize) -> Option<Bytes> {
        let mut inner = self.lock();
        (inner.data.len() >= count).then(|| inner.data.split_to(count).freeze())
    }

    /// Remove all bytes up to and including the first `terminator`
    pub fn consume_until(&self, terminator: u8) -> Option<Bytes> {
        let mut inner = self.lock();
        let index = inner.data.iter().position(|&b| b == terminator)?;
        Some(inner.data.split_to(index + 1).freeze())
    }

    /// Whether `byte` is currently buffered
    pub fn contains(&self, byte: u8) -> bool {
        self.lock().data.contains(&byte)
    }

    /// Drop every buffered byte
    pub fn clear(&self) {
        self.lock().data.clear();
    }

    /// Whether the buffer is accepting data
    pub fn is_open(&self) -> bool {
        self.lock().closed.is_none()
    }

    /// The reason the buffer was closed, if it is closed
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    /// Mark the buffer closed and wake every waiting reader. Buffered bytes
    /// stay readable.
    pub fn close(&self, reason: CloseReason) {
        self.lock().closed = Some(reason);
        self.notify.notify_waiters();
    }

    /// Mark the buffer open again
    pub fn reopen(&self) {
        self.lock().closed = None;
    }

    /// Wait until `count` bytes are buffered, then remove and return them.
    ///
    /// Cancellation returns [`DeviceError::NotEnoughDataAvailable`] and
    /// leaves the buffer untouched. A closed buffer still serves a read it
    /// can satisfy from what it already holds.
    pub async fn read_exact(&self, count: usize, cancel: &CancellationToken) -> Result<Bytes> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let available = {
                let mut inner = self.lock();
                if inner.data.len() >= count {
                    return Ok(inner.data.split_to(count).freeze());
                }
                if let Some(reason) = &inner.closed {
                    return Err(reason.to_error());
                }
                inner.data.len()
            };

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    return Err(DeviceError::NotEnoughDataAvailable {
                        requested: count,
                        available,
                    });
                }
            }
        }
    }

    /// Wait until `terminator` is buffered, then remove and return every
    /// byte up to and including its first occurrence.
    ///
    /// Cancellation returns [`DeviceError::DeviceTimeout`] and leaves the
    /// buffer untouched.
    pub async fn read_until(&self, terminator: u8, cancel: &CancellationToken) -> Result<Bytes> {
        // Bytes before `searched` are known not to hold the terminator.
        let mut searched = 0;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if searched > inner.data.len() {
                    searched = 0;
                }
                if let Some(offset) = inner.data[searched..].iter().position(|&b| b == terminator) {
                    return Ok(inner.data.split_to(searched + offset + 1).freeze());
                }
                searched = inner.data.len();
                if let Some(reason) = &inner.closed {
                    return Err(reason.to_error());
                }
            }

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(DeviceError::DeviceTimeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_consume_and_peek() {
        let buffer = ReceiveBuffer::new();
        buffer.append(b"hello");
        assert_eq!(buffer.peek(2), Bytes::from_static(b"he"));
        assert_eq!(buffer.peek(10), Bytes::from_static(b"hello"));
        assert_eq!(buffer.consume(6), None);
        assert_eq!(buffer.consume(4), Some(Bytes::from_static(b"hell")));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_consume_until() {
        let buffer = ReceiveBuffer::new();
        buffer.append(b"ab\ncd\n");
        assert!(buffer.contains(b'\n'));
        assert_eq!(buffer.consume_until(b'\n'), Some(Bytes::from_static(b"ab\n")));
        assert_eq!(buffer.consume_until(b'\n'), Some(Bytes::from_static(b"cd\n")));
        assert_eq!(buffer.consume_until(b'\n'), None);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_exact_waits_for_producer() {
        let buffer = Arc::new(ReceiveBuffer::new());
        let producer = buffer.clone();
        tokio::spawn(async move {
            for chunk in [&b"ab"[..], b"c", b"defg"] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                producer.append(chunk);
            }
        });

        let cancel = CancellationToken::new();
        assert_eq!(buffer.read_exact(3, &cancel).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(buffer.read_exact(4, &cancel).await.unwrap(), Bytes::from_static(b"defg"));
    }

    #[tokio::test]
    async fn test_read_exact_zero_is_immediate() {
        let buffer = ReceiveBuffer::new();
        let cancel = CancellationToken::new();
        assert!(buffer.read_exact(0, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_read_leaves_buffer_intact() {
        let buffer = ReceiveBuffer::new();
        buffer.append(b"1234");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = buffer.read_exact(8, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::NotEnoughDataAvailable { requested: 8, available: 4 }
        ));
        assert_eq!(buffer.peek(8), Bytes::from_static(b"1234"));

        let err = buffer.read_until(b'\n', &cancel).await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceTimeout));
        assert_eq!(buffer.len(), 4);
    }

    #[tokio::test]
    async fn test_read_until_across_appends() {
        let buffer = Arc::new(ReceiveBuffer::new());
        let producer = buffer.clone();
        let reader = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            buffer.read_until(b';', &cancel).await
        });

        for byte in b"set 1;rest" {
            producer.append(&[*byte]);
            tokio::task::yield_now().await;
        }

        assert_eq!(reader.await.unwrap().unwrap(), Bytes::from_static(b"set 1;"));
        assert_eq!(producer.peek(16), Bytes::from_static(b"rest"));
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let buffer = Arc::new(ReceiveBuffer::new());
        let closer = buffer.clone();
        let reader = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            buffer.read_exact(2, &cancel).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close(CloseReason::ConnectionLost("unplugged".into()));

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, DeviceError::ConnectionLost(msg) if msg == "unplugged"));
    }

    #[tokio::test]
    async fn test_closed_buffer_serves_buffered_bytes() {
        let buffer = ReceiveBuffer::new();
        buffer.append(b"ok\n");
        buffer.close(CloseReason::Disconnected);

        let cancel = CancellationToken::new();
        assert_eq!(buffer.read_until(b'\n', &cancel).await.unwrap(), Bytes::from_static(b"ok\n"));
        assert!(matches!(
            buffer.read_exact(1, &cancel).await,
            Err(DeviceError::NotConnected)
        ));
    }
}
