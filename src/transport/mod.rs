//! Outbound message transport.

mod client;
mod error;
mod types;

use std::future::Future;

pub use client::HttpTransport;
pub use error::DeliveryError;
pub use types::{DeliveryReceipt, OutboundMessage};

/// Hands a rendered message to a delivery provider.
pub trait Transport: Send + Sync {
    fn deliver(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send;
}
