use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{GatewayError, PaymentGateway, PaymentIntent};
use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout: Duration,
}

impl From<&AppConfig> for HttpGatewayConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            base_url: cfg.payment_gateway_url.clone(),
            secret_key: cfg.payment_gateway_secret.clone(),
            timeout: cfg.gateway_timeout(),
        }
    }
}

/// HTTP implementation of [`PaymentGateway`] against a Stripe-shaped
/// payment-intent API.
pub struct HttpPaymentGateway {
    config: HttpGatewayConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IntentPayload {
    id: String,
    status: String,
    amount: i64,
    client_secret: Option<String>,
}

impl From<IntentPayload> for PaymentIntent {
    fn from(payload: IntentPayload) -> Self {
        PaymentIntent {
            id: payload.id,
            status: payload.status,
            amount_minor: payload.amount,
            client_secret: payload.client_secret,
        }
    }
}

impl HttpPaymentGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn decode(&self, response: reqwest::Response) -> Result<PaymentIntent, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Protocol(format!(
                "gateway answered {}: {}",
                status, body
            )));
        }

        response
            .json::<IntentPayload>()
            .await
            .map(PaymentIntent::from)
            .map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.to_string())
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        debug!(amount_minor, currency, "creating gateway payment intent");

        let response = self
            .http
            .post(self.endpoint("/v1/payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .form(&[
                ("amount", amount_minor.to_string()),
                ("currency", currency.to_ascii_lowercase()),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        self.decode(response).await
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        debug!(intent_id, "retrieving gateway payment intent");

        let response = self
            .http
            .get(self.endpoint(&format!("/v1/payment_intents/{}", intent_id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(classify_transport)?;

        self.decode(response).await
    }
}
