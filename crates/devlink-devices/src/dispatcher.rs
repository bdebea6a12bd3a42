/*!
 * Transaction dispatch.
 *
 * The dispatcher runs a transaction against a transport: encode, transmit,
 * read according to the transaction's strategy, decode. Neither the
 * transport nor the encoder knows about the other.
 */
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use devlink_core::config::TransportSettings;
use devlink_core::logging::operation_span;
use devlink_core::utils::cancel_after;

use crate::device::Result;
use crate::encoder::Encoder;
use crate::transaction::{ReadStrategy, Transaction, ValueOf};
use crate::transport::Transport;

/// Dispatcher settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Deadline for the `*_timeout` operations
    pub timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
        }
    }
}

impl From<&TransportSettings> for DispatcherConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            timeout: settings.read_timeout(),
        }
    }
}

/// Runs transactions against one transport
#[derive(Debug)]
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    config: DispatcherConfig,
    cancel: CancellationToken,
}

impl<T: Transport> Dispatcher<T> {
    /// Create a dispatcher with default settings
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_config(transport, DispatcherConfig::default())
    }

    /// Create a dispatcher with explicit settings
    pub fn with_config(transport: Arc<T>, config: DispatcherConfig) -> Self {
        Self {
            transport,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// The transport transactions run against
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The dispatcher settings
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Encode and transmit a request without reading a response
    pub async fn write<X: Transaction>(&self, transaction: &X, request: &ValueOf<X>) -> Result<()> {
        transaction.strategy().validate()?;
        let bytes = transaction.encoder().encode(request);
        debug!("Writing {} bytes to {}", bytes.len(), self.transport.address());
        self.transport.transmit(&bytes).await
    }

    /// Read and decode one response without transmitting
    pub async fn read<X: Transaction>(
        &self,
        transaction: &X,
        cancel: &CancellationToken,
    ) -> Result<ValueOf<X>> {
        let strategy = transaction.strategy();
        strategy.validate()?;

        let raw = match strategy {
            ReadStrategy::ByLength(length) => self.transport.read_exact(length, cancel).await?,
            ReadStrategy::UntilByte(terminator) => {
                self.transport.read_until(terminator, cancel).await?
            }
        };
        debug!("Read {} bytes ({}) from {}", raw.len(), strategy, self.transport.address());

        Ok(transaction.encoder().decode(&raw)?)
    }

    /// Transmit a request and read its response
    pub async fn exchange<X: Transaction>(
        &self,
        transaction: &X,
        request: &ValueOf<X>,
        cancel: &CancellationToken,
    ) -> Result<ValueOf<X>> {
        let address = self.transport.address();
        async {
            self.write(transaction, request).await?;
            self.read(transaction, cancel).await
        }
        .instrument(operation_span("exchange", &address))
        .await
    }

    /// [`read`](Self::read) bounded by the configured timeout
    pub async fn read_timeout<X: Transaction>(&self, transaction: &X) -> Result<ValueOf<X>> {
        let deadline = cancel_after(&self.cancel, self.config.timeout);
        self.read(transaction, deadline.token()).await
    }

    /// [`exchange`](Self::exchange) bounded by the configured timeout
    pub async fn exchange_timeout<X: Transaction>(
        &self,
        transaction: &X,
        request: &ValueOf<X>,
    ) -> Result<ValueOf<X>> {
        let deadline = cancel_after(&self.cancel, self.config.timeout);
        self.exchange(transaction, request, deadline.token()).await
    }

    /// Cancel every pending `*_timeout` operation. Later `*_timeout` calls
    /// fail immediately.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
