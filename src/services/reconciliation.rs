use crate::{
    entities::{order, processed_webhook_event},
    errors::ServiceError,
    events::{Event, EventSender},
    services::payments::{PaymentStatus, ORDER_STATUS_PROCESSING},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    SqlErr,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Envelope the gateway wraps around every event delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Gateway-assigned event identifier; the idempotency key when present.
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

/// Intent snapshot carried by `payment_succeeded` / `payment_failed` events.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentSnapshot {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

/// Charge snapshot carried by `charge_refunded` events.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeSnapshot {
    pub id: String,
    #[serde(alias = "payment_intent_id")]
    pub payment_intent: String,
}

/// The closed set of gateway events this service reconciles.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    PaymentSucceeded(IntentSnapshot),
    PaymentFailed(IntentSnapshot),
    ChargeRefunded(ChargeSnapshot),
}

impl GatewayEvent {
    /// Classify an envelope into a known event, `None` for types this
    /// service does not handle. Gateways evolve their event catalog
    /// independently, so unknown types are not an error.
    pub fn classify(envelope: &WebhookEnvelope) -> Result<Option<Self>, serde_json::Error> {
        let object = envelope.data.object.clone();
        let event = match envelope.event_type.as_str() {
            "payment_succeeded" => Some(Self::PaymentSucceeded(serde_json::from_value(object)?)),
            "payment_failed" => Some(Self::PaymentFailed(serde_json::from_value(object)?)),
            "charge_refunded" => Some(Self::ChargeRefunded(serde_json::from_value(object)?)),
            _ => None,
        };
        Ok(event)
    }

    /// The intent identifier used to resolve the owning order.
    pub fn intent_id(&self) -> &str {
        match self {
            Self::PaymentSucceeded(intent) | Self::PaymentFailed(intent) => &intent.id,
            Self::ChargeRefunded(charge) => &charge.payment_intent,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded(_) => "payment_succeeded",
            Self::PaymentFailed(_) => "payment_failed",
            Self::ChargeRefunded(_) => "charge_refunded",
        }
    }
}

/// What a delivery amounted to, for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The transition landed on the ledger.
    Applied,
    /// Event id already recorded; at-least-once redelivery.
    Duplicate,
    /// No order carries the referenced intent id.
    NoMatchingOrder,
    /// The order is no longer in the expected prior state; late or
    /// out-of-order delivery, dropped without a write.
    StaleTransition,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::NoMatchingOrder => "no_matching_order",
            Self::StaleTransition => "stale_transition",
        }
    }
}

/// Applies gateway webhook events to the order ledger.
///
/// Safe under at-least-once, out-of-order delivery: every event id is
/// recorded in a unique-keyed ledger before processing, and every ledger
/// write is a compare-and-swap guarded by the expected prior payment status.
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl ReconciliationService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self, event), fields(event_type = event.kind(), intent_id = event.intent_id()))]
    pub async fn handle_event(
        &self,
        event_id: Option<&str>,
        event: &GatewayEvent,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let order = match self.find_order(event.intent_id()).await? {
            Some(order) => order,
            None => {
                // The order may belong to another environment, or the webhook
                // raced ahead of intent persistence. Ack without recording the
                // event id so a redelivery can still land once the order exists.
                warn!("no order matches webhook intent");
                return Ok(ReconcileOutcome::NoMatchingOrder);
            }
        };

        if let Some(event_id) = event_id {
            if !self.record_event(event_id, event).await? {
                debug!(event_id, "event already processed; dropping redelivery");
                return Ok(ReconcileOutcome::Duplicate);
            }
        }

        let (applied, ledger_event) = match event {
            GatewayEvent::PaymentSucceeded(_) => (
                self.transition(
                    order.id,
                    PaymentStatus::Pending,
                    PaymentStatus::Completed,
                    Some(ORDER_STATUS_PROCESSING),
                )
                .await?,
                Event::PaymentCompleted(order.id),
            ),
            GatewayEvent::PaymentFailed(_) => (
                self.transition(order.id, PaymentStatus::Pending, PaymentStatus::Failed, None)
                    .await?,
                Event::PaymentFailed(order.id),
            ),
            GatewayEvent::ChargeRefunded(_) => (
                self.transition(
                    order.id,
                    PaymentStatus::Completed,
                    PaymentStatus::Refunded,
                    None,
                )
                .await?,
                Event::PaymentRefunded(order.id),
            ),
        };

        if !applied {
            debug!(order_id = %order.id, "transition guard rejected stale event");
            return Ok(ReconcileOutcome::StaleTransition);
        }

        let _ = self.event_sender.send(ledger_event).await;
        Ok(ReconcileOutcome::Applied)
    }

    /// Record the event id in the idempotency ledger. Returns false when the
    /// id was already present.
    async fn record_event(&self, event_id: &str, event: &GatewayEvent) -> Result<bool, ServiceError> {
        let model = processed_webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            event_id: Set(event_id.to_string()),
            event_type: Set(event.kind().to_string()),
            gateway_intent_id: Set(Some(event.intent_id().to_string())),
            received_at: Set(Utc::now()),
        };

        match model.insert(&*self.db).await {
            Ok(_) => Ok(true),
            Err(err) => match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => Ok(false),
                _ => Err(err.into()),
            },
        }
    }

    /// Resolve the single order owning a gateway intent. Two or more matches
    /// is a data-integrity fault, never a normal branch.
    async fn find_order(&self, intent_id: &str) -> Result<Option<order::Model>, ServiceError> {
        let matches = order::Entity::find()
            .filter(order::Column::GatewayIntentId.eq(intent_id))
            .limit(2)
            .all(&*self.db)
            .await?;

        if matches.len() > 1 {
            error!(intent_id, "multiple orders share one gateway intent");
            return Err(ServiceError::IntegrityFault(format!(
                "gateway intent {} resolves to more than one order",
                intent_id
            )));
        }

        Ok(matches.into_iter().next())
    }

    /// Compare-and-swap the payment status, optionally moving the order's
    /// fulfillment status in the same statement. Returns whether a row
    /// changed; a miss means the order already left the expected state.
    async fn transition(
        &self,
        order_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        order_status: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let mut values = order::ActiveModel {
            payment_status: Set(to.to_string()),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        if let Some(status) = order_status {
            values.status = Set(status.to_string());
        }

        let result = order::Entity::update_many()
            .set(values)
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(from.to_string()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, object: serde_json::Value) -> WebhookEnvelope {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "data": { "object": object }
        }))
        .expect("envelope parses")
    }

    #[test]
    fn known_event_types_classify_into_variants() {
        let succeeded = GatewayEvent::classify(&envelope(
            "payment_succeeded",
            json!({"id": "pi_1", "status": "succeeded", "amount": 5000}),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(succeeded.kind(), "payment_succeeded");
        assert_eq!(succeeded.intent_id(), "pi_1");

        let failed = GatewayEvent::classify(&envelope(
            "payment_failed",
            json!({"id": "pi_2"}),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(failed.kind(), "payment_failed");
        assert_eq!(failed.intent_id(), "pi_2");
    }

    #[test]
    fn refund_events_resolve_through_the_charge_intent_reference() {
        let refunded = GatewayEvent::classify(&envelope(
            "charge_refunded",
            json!({"id": "ch_1", "payment_intent": "pi_3"}),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(refunded.kind(), "charge_refunded");
        assert_eq!(refunded.intent_id(), "pi_3");

        // legacy field spelling
        let aliased = GatewayEvent::classify(&envelope(
            "charge_refunded",
            json!({"id": "ch_2", "payment_intent_id": "pi_4"}),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(aliased.intent_id(), "pi_4");
    }

    #[test]
    fn unknown_event_types_classify_to_none() {
        let unknown = GatewayEvent::classify(&envelope(
            "customer_created",
            json!({"id": "cus_1"}),
        ))
        .unwrap();
        assert!(unknown.is_none());
    }

    #[test]
    fn known_type_with_malformed_object_is_a_parse_error() {
        let result = GatewayEvent::classify(&envelope(
            "payment_succeeded",
            json!({"amount": 5000}),
        ));
        assert!(result.is_err());
    }

    #[test]
    fn outcomes_expose_stable_metric_labels() {
        assert_eq!(ReconcileOutcome::Applied.as_str(), "applied");
        assert_eq!(ReconcileOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(ReconcileOutcome::NoMatchingOrder.as_str(), "no_matching_order");
        assert_eq!(ReconcileOutcome::StaleTransition.as_str(), "stale_transition");
    }
}
