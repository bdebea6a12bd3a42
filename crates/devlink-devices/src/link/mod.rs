/*!
 * Byte-stream links.
 *
 * A link is the raw channel underneath a transport: it knows how to open
 * itself and hands back a reader half and a writer half. Buffering, the
 * background read loop and the outcome taxonomy live in the transport.
 */
use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::device::DeviceError;

pub mod memory;

#[cfg(feature = "serial")]
pub mod serial;

/// Reading half of an open link
#[async_trait]
pub trait LinkReader: Send + 'static {
    /// Wait for the next chunk of bytes. An empty chunk means no data
    /// arrived yet and is not end-of-stream.
    async fn read(&mut self) -> io::Result<Bytes>;
}

/// Writing half of an open link
#[async_trait]
pub trait LinkWriter: Send + 'static {
    /// Write every byte
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Release the channel
    async fn close(&mut self) -> io::Result<()>;
}

/// An openable byte-stream channel
#[async_trait]
pub trait Link: Send + Sync + Debug + 'static {
    /// Printable address of the channel, e.g. a port name
    fn address(&self) -> String;

    /// Open the channel
    async fn open(&self) -> io::Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)>;
}

/// Map an open failure to a connection outcome. A permission failure means
/// the device is there but held by someone else.
pub fn open_error(address: &str, err: io::Error) -> DeviceError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            DeviceError::AccessDenied(format!("{}: {}", address, err))
        }
        _ => DeviceError::ConnectionFailed(format!("{}: {}", address, err)),
    }
}

/// Whether a read error means the channel itself went away
pub fn is_channel_gone(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_distinguishes_access_denied() {
        let err = open_error("COM3", io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        assert!(matches!(err, DeviceError::AccessDenied(msg) if msg.contains("COM3")));

        let err = open_error("COM3", io::Error::new(io::ErrorKind::NotFound, "absent"));
        assert!(matches!(err, DeviceError::ConnectionFailed(_)));
    }

    #[test]
    fn test_channel_gone_kinds() {
        assert!(is_channel_gone(io::ErrorKind::BrokenPipe));
        assert!(!is_channel_gone(io::ErrorKind::InvalidData));
    }
}
