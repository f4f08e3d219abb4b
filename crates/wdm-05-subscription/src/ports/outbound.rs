//! # Outbound Ports
//!
//! The transport/session layer. Exchanges are cancelable, timeout-bearing
//! channels; retransmission and encryption live below this port.

use crate::domain::TransportError;
use async_trait::async_trait;
use shared_types::{ExchangeHandle, PeerId, WdmMessage};

/// Exchange-oriented transport - outbound port.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens an exchange to `peer`.
    async fn open_exchange(&self, peer: PeerId) -> Result<ExchangeHandle, TransportError>;

    /// Sends one message on an exchange.
    async fn send(&self, exchange: ExchangeHandle, message: WdmMessage)
        -> Result<(), TransportError>;

    /// Waits for the next message on an exchange. Must be cancel-safe.
    async fn on_message(&self, exchange: ExchangeHandle) -> Result<WdmMessage, TransportError>;

    /// Closes an exchange. Pending and later receives fail.
    fn close(&self, exchange: ExchangeHandle);
}
