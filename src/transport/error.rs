//! Delivery errors returned by a [`Transport`](super::Transport).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Provider answered 429. `retry_after_ms` is how long it asked us to wait.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Temporary provider or infrastructure failure (5xx, timeout).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Provider refused the message for good (bad address, hard bounce).
    #[error("delivery rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl DeliveryError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::Rejected { .. })
    }

    /// Minimum wait the provider asked for, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            DeliveryError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
