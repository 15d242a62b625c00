use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

pub mod http;

pub use self::http::{HttpGatewayConfig, HttpPaymentGateway};

/// Snapshot of a gateway-side payment intent.
///
/// The status is carried as the gateway reports it; this service never
/// interprets intermediate statuses, only terminal webhook events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount_minor: i64,
    pub client_secret: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("unexpected gateway response: {0}")]
    Protocol(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::GatewayUnavailable(err.to_string())
    }
}

/// Client for the external payment gateway's intent API.
///
/// One implementation per process is injected through `AppState`; tests
/// substitute their own.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent for the given amount in minor currency units.
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Retrieve the current state of an intent by its identifier.
    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
}
