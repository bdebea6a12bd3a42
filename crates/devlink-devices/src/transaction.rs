/*!
 * Transaction descriptors.
 *
 * A transaction names one request/response shape: the encoder that
 * converts its values and the strategy that delimits its response. The
 * encoder is an associated type, so a transaction cannot be paired with an
 * encoder for a different value type.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result};
use crate::encoder::Encoder;

/// How a response is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadStrategy {
    /// The response is exactly this many bytes
    ByLength(usize),
    /// The response ends at this byte, inclusive
    UntilByte(u8),
}

impl ReadStrategy {
    /// A by-length strategy; a zero length is a configuration error
    pub fn by_length(length: usize) -> Result<Self> {
        let strategy = ReadStrategy::ByLength(length);
        strategy.validate()?;
        Ok(strategy)
    }

    /// An until-terminator strategy
    pub fn until(terminator: u8) -> Self {
        ReadStrategy::UntilByte(terminator)
    }

    /// Reject strategies that can never produce a response
    pub fn validate(&self) -> Result<()> {
        match self {
            ReadStrategy::ByLength(0) => Err(DeviceError::Configuration(
                "by-length read strategy needs a non-zero length".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStrategy::ByLength(n) => write!(f, "{} bytes", n),
            ReadStrategy::UntilByte(b) => write!(f, "until {:#04x}", b),
        }
    }
}

/// One request/response shape
pub trait Transaction: Send + Sync {
    /// Encoder for this transaction's wire values
    type Encoder: Encoder;

    /// The encoder instance
    fn encoder(&self) -> &Self::Encoder;

    /// How the response is delimited
    fn strategy(&self) -> ReadStrategy;
}

/// Value type a transaction exchanges
pub type ValueOf<X> = <<X as Transaction>::Encoder as Encoder>::Value;

/// A transaction assembled from an encoder and a strategy at run time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange<E> {
    encoder: E,
    strategy: ReadStrategy,
}

impl<E: Encoder> Exchange<E> {
    /// A transaction whose response is `length` bytes
    pub fn by_length(encoder: E, length: usize) -> Result<Self> {
        Ok(Self {
            encoder,
            strategy: ReadStrategy::by_length(length)?,
        })
    }

    /// A transaction whose response ends at `terminator`
    pub fn until(encoder: E, terminator: u8) -> Self {
        Self {
            encoder,
            strategy: ReadStrategy::until(terminator),
        }
    }
}

impl<E: Encoder> Transaction for Exchange<E> {
    type Encoder = E;

    fn encoder(&self) -> &E {
        &self.encoder
    }

    fn strategy(&self) -> ReadStrategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::RawEncoder;

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            ReadStrategy::by_length(0),
            Err(DeviceError::Configuration(_))
        ));
        assert!(Exchange::by_length(RawEncoder, 0).is_err());
        assert_eq!(ReadStrategy::by_length(8).unwrap(), ReadStrategy::ByLength(8));
    }

    #[test]
    fn test_exchange_strategy() {
        let tx = Exchange::until(RawEncoder, b'\n');
        assert_eq!(tx.strategy(), ReadStrategy::UntilByte(0x0a));
        assert_eq!(tx.strategy().to_string(), "until 0x0a");

        let tx = Exchange::by_length(RawEncoder, 8).unwrap();
        assert_eq!(tx.strategy().to_string(), "8 bytes");
    }
}
