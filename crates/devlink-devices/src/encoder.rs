/*!
 * Encoder plug-ins.
 *
 * An encoder converts between one wire value type and its byte form. It is
 * pure and stateless; the transport and the read strategy are chosen
 * elsewhere.
 */
use bytes::Bytes;
use thiserror::Error;

/// Why a response could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No byte satisfying the encoder's start predicate was found
    #[error("no valid start byte in {0} bytes")]
    NoValidStart(usize),

    /// Fewer bytes than a frame needs
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes a frame needs
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// The frame checksum did not match its contents
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Checksum computed over the frame
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
    },

    /// The payload is structurally invalid
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The payload does not fit the value type
    #[error("payload of {actual} bytes exceeds capacity {capacity}")]
    Oversized {
        /// Largest payload the value type holds
        capacity: usize,
        /// Payload length
        actual: usize,
    },
}

/// Encode/decode pair for one wire format
pub trait Encoder: Send + Sync {
    /// The value carried on the wire
    type Value: Send;

    /// Convert a value to bytes
    fn encode(&self, value: &Self::Value) -> Bytes;

    /// Convert bytes back to a value
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, DecodeError>;
}

/// Skip leading noise: return the slice starting at the first byte that
/// satisfies `is_start`.
///
/// ```
/// use devlink_devices::encoder::skip_noise;
///
/// let payload = skip_noise(b"\x00\xffOK\n", |b| b.is_ascii_graphic()).unwrap();
/// assert_eq!(payload, b"OK\n");
/// ```
pub fn skip_noise<P>(bytes: &[u8], is_start: P) -> Result<&[u8], DecodeError>
where
    P: Fn(u8) -> bool,
{
    bytes
        .iter()
        .position(|&b| is_start(b))
        .map(|start| &bytes[start..])
        .ok_or(DecodeError::NoValidStart(bytes.len()))
}

/// Passes bytes through untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Value = Bytes;

    fn encode(&self, value: &Bytes) -> Bytes {
        value.clone()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, DecodeError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
