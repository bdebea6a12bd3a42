/*!
 * Line protocol.
 *
 * Requests and responses are printable ASCII terminated by `\n`. Devices
 * may answer with `\r\n` and often emit line-discipline garbage before the
 * first character after a reset; both are tolerated on decode.
 */
use std::fmt;
use std::ops::Deref;

use bytes::{BufMut, Bytes, BytesMut};

use devlink_core::error::{Error, Result};
use devlink_core::types::BoundedString;

use crate::encoder::{skip_noise, DecodeError, Encoder};
use crate::transaction::{ReadStrategy, Transaction};

/// Line terminator
pub const TERMINATOR: u8 = b'\n';

/// Longest line payload in bytes
pub const MAX_LINE: usize = 256;

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte)
}

/// One line without its terminator.
///
/// Holds at most [`MAX_LINE`] bytes of printable ASCII, so it never contains
/// `\r` or `\n` and always survives an encode/decode round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Line(BoundedString<MAX_LINE>);

impl Line {
    /// Create a line, rejecting control characters, non-ASCII text and
    /// input longer than [`MAX_LINE`] bytes
    pub fn try_new<S: Into<String>>(s: S) -> Result<Self> {
        let s = s.into();
        if let Some(offset) = s.bytes().position(|b| !is_printable(b)) {
            return Err(Error::validation(format!(
                "line holds non-printable byte {:#04x} at offset {}",
                s.as_bytes()[offset],
                offset
            )));
        }
        BoundedString::try_new(s).map(Line)
    }

    /// Get the string slice
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for Line {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder for [`Line`] values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineEncoder;

impl Encoder for LineEncoder {
    type Value = Line;

    fn encode(&self, value: &Line) -> Bytes {
        let mut bytes = BytesMut::with_capacity(value.len() + 1);
        bytes.put_slice(value.as_bytes());
        bytes.put_u8(TERMINATOR);
        bytes.freeze()
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Line, DecodeError> {
        let bytes = bytes.strip_suffix(&[TERMINATOR]).unwrap_or(bytes);
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        if bytes.is_empty() {
            return Ok(Line::default());
        }

        let payload = skip_noise(bytes, is_printable)?;
        if let Some(pos) = payload.iter().position(|b| !is_printable(*b)) {
            return Err(DecodeError::InvalidPayload(format!(
                "non-printable byte {:#04x} at offset {}",
                payload[pos], pos
            )));
        }
        if payload.len() > MAX_LINE {
            return Err(DecodeError::Oversized {
                capacity: MAX_LINE,
                actual: payload.len(),
            });
        }

        let text = std::str::from_utf8(payload)
            .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
        Line::try_new(text).map_err(|e| DecodeError::InvalidPayload(e.to_string()))
    }
}

/// A request answered by one line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCommand {
    encoder: LineEncoder,
}

impl LineCommand {
    /// Create the transaction
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transaction for LineCommand {
    type Encoder = LineEncoder;

    fn encoder(&self) -> &LineEncoder {
        &self.encoder
    }

    fn strategy(&self) -> ReadStrategy {
        ReadStrategy::UntilByte(TERMINATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Line {
        Line::try_new(s).unwrap()
    }

    #[test]
    fn test_encode_appends_terminator() {
        assert_eq!(LineEncoder.encode(&line("*IDN?")), Bytes::from_static(b"*IDN?\n"));
    }

    #[test]
    fn test_decode_tolerates_noise_and_crlf() {
        assert_eq!(LineEncoder.decode(b"\x00\xff\x07OK 12\r\n").unwrap(), line("OK 12"));
        assert_eq!(LineEncoder.decode(b"  indented\n").unwrap(), line("  indented"));
        assert_eq!(LineEncoder.decode(b"\n").unwrap(), line(""));
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            LineEncoder.decode(b"\x00\x01\n"),
            Err(DecodeError::NoValidStart(2))
        );
        assert!(matches!(
            LineEncoder.decode("temp 21\u{b0}C\n".as_bytes()),
            Err(DecodeError::InvalidPayload(_))
        ));

        let long = vec![b'a'; MAX_LINE + 1];
        assert_eq!(
            LineEncoder.decode(&long),
            Err(DecodeError::Oversized {
                capacity: MAX_LINE,
                actual: MAX_LINE + 1
            })
        );
    }

    #[test]
    fn test_line_rejects_what_decode_cannot_return() {
        for text in ["\tcmd", "ab\r", "a\nb", "temp 21\u{b0}C", "\x00", "bell\x07"] {
            assert!(Line::try_new(text).is_err(), "{:?} accepted", text);
        }
        assert!(Line::try_new("x".repeat(MAX_LINE + 1)).is_err());
        assert_eq!(line("  lead").as_str(), "  lead");
    }

    #[test]
    fn test_round_trip() {
        for text in ["", "PING", "set 1 2 3", "~!@#$%^&*()", " ", "  lead", "trail  "] {
            let value = line(text);
            assert_eq!(LineEncoder.decode(&LineEncoder.encode(&value)).unwrap(), value);
        }

        // Every printable byte, in every position of a full-length line.
        let printable: Vec<u8> = (0x20u8..=0x7e).collect();
        for start in 0..printable.len() {
            let text: String = printable
                .iter()
                .cycle()
                .skip(start)
                .take(MAX_LINE)
                .map(|b| *b as char)
                .collect();
            let value = line(&text);
            let encoded = LineEncoder.encode(&value);
            assert_eq!(encoded.iter().filter(|b| **b == TERMINATOR).count(), 1);
            assert_eq!(LineEncoder.decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_decode_rejects_embedded_control_bytes() {
        assert!(matches!(
            LineEncoder.decode(b"ok\tthen\n"),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_command_reads_until_newline() {
        assert_eq!(LineCommand::new().strategy(), ReadStrategy::UntilByte(b'\n'));
    }
}
