use crate::auth::{consts as perm, AuthenticatedUser};
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{
    PaymentConfirmation, PaymentInitiation, PaymentMethod, PaymentService,
};
use crate::ApiResponse;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::post,
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "method": "card",
    "amount": "149.99"
}))]
pub struct CreatePaymentRequest {
    /// Order to create the payment against
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub order_id: Uuid,

    /// Payment method (card, cash_on_delivery)
    #[validate(length(min = 1, message = "payment method is required"))]
    #[schema(example = "card")]
    pub method: String,

    /// Payment amount in major currency units
    #[schema(example = "149.99")]
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "payment_id": "pi_3OqJ8aFz2eZvKYlo",
    "method": "card"
}))]
pub struct ConfirmPaymentRequest {
    /// Gateway intent identifier returned at creation time
    #[validate(length(min = 1, message = "payment id is required"))]
    #[schema(example = "pi_3OqJ8aFz2eZvKYlo")]
    pub payment_id: String,

    /// Payment method the intent was created with
    #[schema(example = "card")]
    pub method: String,
}

/// Create a payment for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments",
    request_body = CreatePaymentRequest,
    responses(
        (status = 201, description = "Payment created", body = crate::ApiResponse<PaymentInitiation>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentInitiation>>), ServiceError> {
    if !user.has_permission(perm::PAYMENTS_WRITE) {
        return Err(ServiceError::Forbidden(
            "Insufficient permissions".to_string(),
        ));
    }

    request.validate()?;

    let method = PaymentMethod::resolve(&request.method)?;

    let payment_service = PaymentService::new(
        state.db.clone(),
        state.gateway.clone(),
        Arc::new(state.event_sender.clone()),
        state.config.gateway_timeout(),
    );

    let initiation = payment_service
        .create_payment(request.order_id, method, request.amount)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(initiation))))
}

/// Poll gateway-side status of a card payment intent
#[utoipa::path(
    post,
    path = "/api/v1/payments/confirm",
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 200, description = "Current intent status", body = crate::ApiResponse<PaymentConfirmation>),
        (status = 400, description = "Unsupported method", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<ApiResponse<PaymentConfirmation>>, ServiceError> {
    if !user.has_permission(perm::PAYMENTS_READ) {
        return Err(ServiceError::Forbidden(
            "Insufficient permissions".to_string(),
        ));
    }

    request.validate()?;

    let method = PaymentMethod::resolve(&request.method)?;

    let payment_service = PaymentService::new(
        state.db.clone(),
        state.gateway.clone(),
        Arc::new(state.event_sender.clone()),
        state.config.gateway_timeout(),
    );

    let confirmation = payment_service
        .confirm_payment(&request.payment_id, method)
        .await?;

    Ok(Json(ApiResponse::success(confirmation)))
}

/// Payment routes
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_payment))
        .route("/confirm", post(confirm_payment))
        .route(
            "/webhook",
            post(crate::handlers::payment_webhooks::payment_webhook),
        )
}
