/*!
 * Serial port link backed by the `serialport` crate.
 *
 * `serialport` is blocking, so every open, read and write runs on tokio's
 * blocking pool. A read that hits the port timeout yields an empty chunk,
 * which the transport treats as "no data yet".
 */
use std::io::{self, Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::debug;

use devlink_core::config::TransportSettings;

use super::{Link, LinkReader, LinkWriter};

/// Parity setting for a serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// How long one OS read may block before reporting no data
    pub read_timeout: Duration,
    /// Largest chunk read from the OS at once
    pub read_chunk_size: usize,
}

impl SerialConfig {
    /// 8N1 settings for `port` at `baud_rate`
    pub fn new<S: Into<String>>(port: S, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            read_timeout: Duration::from_millis(50),
            read_chunk_size: 256,
        }
    }

    /// Settings for `port` taken from the transport section of the config
    pub fn from_settings<S: Into<String>>(port: S, settings: &TransportSettings) -> Self {
        Self {
            read_chunk_size: settings.read_chunk_size.max(1),
            ..Self::new(port, settings.baud_rate)
        }
    }

    fn data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }
}

/// A serial port link
#[derive(Debug, Clone)]
pub struct SerialLink {
    config: SerialConfig,
}

impl SerialLink {
    /// Create a link for the given settings
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    /// The port settings
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

async fn blocking<F, T>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[async_trait]
impl Link for SerialLink {
    fn address(&self) -> String {
        self.config.port.clone()
    }

    async fn open(&self) -> io::Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
        let config = self.config.clone();
        let port = blocking(move || {
            serialport::new(&config.port, config.baud_rate)
                .data_bits(config.data_bits())
                .parity(config.parity.into())
                .stop_bits(config.stop_bits())
                .timeout(config.read_timeout)
                .open()
                .map_err(io::Error::from)
        })
        .await?;
        let writer = port.try_clone().map_err(io::Error::from)?;
        debug!("Opened serial port {} at {} baud", self.config.port, self.config.baud_rate);

        Ok((
            Box::new(SerialReader {
                port: Some(port),
                chunk: self.config.read_chunk_size.max(1),
            }),
            Box::new(SerialWriter { port: Some(writer) }),
        ))
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
}

struct SerialReader {
    port: Option<Box<dyn SerialPort>>,
    chunk: usize,
}

#[async_trait]
impl LinkReader for SerialReader {
    async fn read(&mut self) -> io::Result<Bytes> {
        let mut port = self.port.take().ok_or_else(closed)?;
        let chunk = self.chunk;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; chunk];
            let result = match port.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Bytes::new()),
                Err(e) => Err(e),
            };
            (port, result)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.port = Some(port);
        result
    }
}

struct SerialWriter {
    port: Option<Box<dyn SerialPort>>,
}

#[async_trait]
impl LinkWriter for SerialWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut port = self.port.take().ok_or_else(closed)?;
        let bytes = bytes.to_vec();
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = port.write_all(&bytes).and_then(|_| port.flush());
            (port, result)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.port = Some(port);
        result
    }

    async fn close(&mut self) -> io::Result<()> {
        self.port.take();
        Ok(())
    }
}
