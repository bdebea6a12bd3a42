/*!
 * Register protocol.
 *
 * Every request and response is one 8-byte frame:
 *
 * ```text
 * [op, addr_hi, addr_lo, v3, v2, v1, v0, checksum]
 * ```
 *
 * `op` is one of `R`, `W`, `A` (ack) or `N` (nack); the value is big-endian
 * and the checksum is the wrapping sum of the first seven bytes.
 */
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::encoder::{skip_noise, DecodeError, Encoder};
use crate::transaction::{ReadStrategy, Transaction};

/// Frame length in bytes
pub const FRAME_LEN: usize = 8;

/// Frame operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterOp {
    /// Read a register
    Read,
    /// Write a register
    Write,
    /// The device accepted the request
    Ack,
    /// The device rejected the request
    Nack,
}

impl RegisterOp {
    /// Wire byte
    pub fn as_byte(self) -> u8 {
        match self {
            RegisterOp::Read => b'R',
            RegisterOp::Write => b'W',
            RegisterOp::Ack => b'A',
            RegisterOp::Nack => b'N',
        }
    }

    /// Parse a wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'R' => Some(RegisterOp::Read),
            b'W' => Some(RegisterOp::Write),
            b'A' => Some(RegisterOp::Ack),
            b'N' => Some(RegisterOp::Nack),
            _ => None,
        }
    }
}

/// One register frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterFrame {
    /// Operation
    pub op: RegisterOp,
    /// Register address
    pub address: u16,
    /// Register value; zero in read requests
    pub value: u32,
}

impl RegisterFrame {
    /// Request to read `address`
    pub fn read(address: u16) -> Self {
        Self {
            op: RegisterOp::Read,
            address,
            value: 0,
        }
    }

    /// Request to write `value` to `address`
    pub fn write(address: u16, value: u32) -> Self {
        Self {
            op: RegisterOp::Write,
            address,
            value,
        }
    }

    /// Positive reply carrying the register value
    pub fn ack(address: u16, value: u32) -> Self {
        Self {
            op: RegisterOp::Ack,
            address,
            value,
        }
    }

    /// Negative reply
    pub fn nack(address: u16) -> Self {
        Self {
            op: RegisterOp::Nack,
            address,
            value: 0,
        }
    }

    /// Whether the device accepted the request
    pub fn is_ack(&self) -> bool {
        self.op == RegisterOp::Ack
    }

    /// Serialize to the 8-byte wire form
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let addr = self.address.to_be_bytes();
        let value = self.value.to_be_bytes();
        let mut frame = [
            self.op.as_byte(),
            addr[0],
            addr[1],
            value[0],
            value[1],
            value[2],
            value[3],
            0,
        ];
        frame[FRAME_LEN - 1] = checksum(&frame[..FRAME_LEN - 1]);
        frame
    }
}

impl fmt::Display for RegisterFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:#06x}={:#010x}",
            self.op.as_byte() as char,
            self.address,
            self.value
        )
    }
}

/// Wrapping byte sum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encoder for [`RegisterFrame`] values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterEncoder;

impl Encoder for RegisterEncoder {
    type Value = RegisterFrame;

    fn encode(&self, value: &RegisterFrame) -> Bytes {
        Bytes::copy_from_slice(&value.to_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<RegisterFrame, DecodeError> {
        let frame = skip_noise(bytes, |b| RegisterOp::from_byte(b).is_some())?;
        if frame.len() < FRAME_LEN {
            return Err(DecodeError::Truncated {
                expected: FRAME_LEN,
                actual: frame.len(),
            });
        }

        let expected = checksum(&frame[..FRAME_LEN - 1]);
        let actual = frame[FRAME_LEN - 1];
        if expected != actual {
            return Err(DecodeError::Checksum { expected, actual });
        }

        let op = RegisterOp::from_byte(frame[0]).ok_or_else(|| {
            DecodeError::InvalidPayload(format!("unknown op {:#04x}", frame[0]))
        })?;
        Ok(RegisterFrame {
            op,
            address: u16::from_be_bytes([frame[1], frame[2]]),
            value: u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]),
        })
    }
}

/// A register request answered by one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterAccess {
    encoder: RegisterEncoder,
}

impl RegisterAccess {
    /// Create the transaction
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transaction for RegisterAccess {
    type Encoder = RegisterEncoder;

    fn encoder(&self) -> &RegisterEncoder {
        &self.encoder
    }

    fn strategy(&self) -> ReadStrategy {
        ReadStrategy::ByLength(FRAME_LEN)
    }
}
