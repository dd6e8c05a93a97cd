use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use super::error::DeliveryError;
use super::types::{AcceptedResponse, DeliveryReceipt, OutboundMessage};
use super::Transport;
use crate::config::DispatcherConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;
/// Longest provider-requested wait honoured (one hour).
const MAX_RETRY_AFTER_MS: u64 = 3_600_000;

/// JSON-over-HTTP delivery provider client.
pub struct HttpTransport {
    api_key: String,
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &DispatcherConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            api_key: config.api_key.clone(),
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header("idempotency-key", &message.idempotency_key)
            .json(message);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000).min(MAX_RETRY_AFTER_MS))
                .unwrap_or(DEFAULT_RETRY_AFTER_MS);
            return Err(DeliveryError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
                return Err(DeliveryError::Transient(format!(
                    "status {}: {message}",
                    status.as_u16()
                )));
            }
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<AcceptedResponse>().await?;
        debug!(provider_id = %body.id, key = %message.idempotency_key, "provider accepted message");
        Ok(DeliveryReceipt {
            provider_id: body.id,
        })
    }
}

impl Transport for HttpTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        self.post(message).await
    }
}
