use serde::{Deserialize, Serialize};

/// One message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracking_refs: Vec<String>,
    /// Sent as the `Idempotency-Key` header, not in the body.
    #[serde(skip)]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_id: String,
}

/// Provider response body for an accepted message.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AcceptedResponse {
    pub id: String,
}
