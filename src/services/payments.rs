use crate::{
    entities::order,
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{GatewayError, PaymentGateway},
};
use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Payment methods accepted at checkout. Resolution from the request string
/// is the policy point for adding further methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    CashOnDelivery,
}

impl PaymentMethod {
    /// Resolve a requested method string to a handler variant.
    pub fn resolve(value: &str) -> Result<Self, ServiceError> {
        value
            .trim()
            .to_ascii_lowercase()
            .parse::<PaymentMethod>()
            .map_err(|_| ServiceError::UnsupportedPaymentMethod(value.to_string()))
    }
}

/// Payment dimension of an order's lifecycle, persisted on `orders.payment_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// Fulfillment status written as a side effect of a pending or successful payment.
pub const ORDER_STATUS_PROCESSING: &str = "processing";

/// Convert a major-unit amount to integer minor units (two fraction digits),
/// rounding midpoints away from zero.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }

    let minor = (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            ServiceError::InvalidAmount(format!("amount {} exceeds the representable range", amount))
        })?;

    if minor == 0 {
        return Err(ServiceError::InvalidAmount(format!(
            "amount {} rounds to zero minor units",
            amount
        )));
    }

    Ok(minor)
}

/// Convert integer minor units back to a major-unit amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Result of `create_payment`, shaped by the resolved method.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentInitiation {
    /// Card capture is asynchronous; the ledger is only touched once the
    /// gateway confirms via webhook.
    Card {
        intent_id: String,
        client_secret: Option<String>,
    },
    CashOnDelivery {
        status: PaymentStatus,
    },
}

/// Result of `confirm_payment`: the gateway-side view of an intent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentConfirmation {
    pub status: String,
    pub amount: Decimal,
}

/// Orchestrates payment creation and confirmation against the order ledger
/// and the external gateway.
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    gateway_timeout: Duration,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
            gateway_timeout,
        }
    }

    /// Create a payment for an existing order.
    #[instrument(skip(self))]
    pub async fn create_payment(
        &self,
        order_id: Uuid,
        method: PaymentMethod,
        amount: Decimal,
    ) -> Result<PaymentInitiation, ServiceError> {
        let amount_minor = to_minor_units(amount)?;

        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        match method {
            PaymentMethod::Card => {
                let intent = self
                    .gateway_call(self.gateway.create_intent(amount_minor, &order.currency))
                    .await?;

                info!(%order_id, intent_id = %intent.id, "created card payment intent");

                Ok(PaymentInitiation::Card {
                    intent_id: intent.id,
                    client_secret: intent.client_secret,
                })
            }
            PaymentMethod::CashOnDelivery => {
                // Single atomic write; repeated calls re-assert the same state.
                let values = order::ActiveModel {
                    payment_status: Set(PaymentStatus::Pending.to_string()),
                    status: Set(ORDER_STATUS_PROCESSING.to_string()),
                    payment_method: Set(Some(PaymentMethod::CashOnDelivery.to_string())),
                    updated_at: Set(Some(Utc::now())),
                    ..Default::default()
                };

                order::Entity::update_many()
                    .set(values)
                    .filter(order::Column::Id.eq(order_id))
                    .exec(&*self.db)
                    .await?;

                let _ = self.event_sender.send(Event::PaymentPending(order_id)).await;

                info!(%order_id, "registered cash-on-delivery payment");

                Ok(PaymentInitiation::CashOnDelivery {
                    status: PaymentStatus::Pending,
                })
            }
        }
    }

    /// Poll the gateway for the current state of a card payment intent.
    ///
    /// Read-only with respect to the order ledger; the webhook stream remains
    /// the source of truth for durable state.
    #[instrument(skip(self))]
    pub async fn confirm_payment(
        &self,
        payment_id: &str,
        method: PaymentMethod,
    ) -> Result<PaymentConfirmation, ServiceError> {
        if method != PaymentMethod::Card {
            return Err(ServiceError::UnsupportedPaymentMethod(format!(
                "confirmation is not supported for {}",
                method
            )));
        }

        let intent = self
            .gateway_call(self.gateway.retrieve_intent(payment_id))
            .await?;

        Ok(PaymentConfirmation {
            status: intent.status,
            amount: from_minor_units(intent.amount_minor),
        })
    }

    /// Run a gateway call under the configured deadline.
    async fn gateway_call<T>(
        &self,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.gateway_timeout, call).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::GatewayUnavailable(
                "gateway call timed out".to_string(),
            )),
        }
    }
}
