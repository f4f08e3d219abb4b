//! # Inbound Ports
//!
//! Entry point for messages arriving on exchanges a peer opened.

use async_trait::async_trait;
use shared_types::{ExchangeHandle, WdmMessage};

/// Handles requests arriving on responder exchanges - inbound port.
///
/// Returned messages are replies on the same exchange, in order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    async fn handle_message(&self, exchange: ExchangeHandle, message: WdmMessage)
        -> Vec<WdmMessage>;
}
