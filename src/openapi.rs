use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.3.0",
        description = r#"
Commerce backend centered on the payment lifecycle: payments are created
against existing orders, card intents are confirmed against the external
gateway, and the gateway's asynchronous webhook stream is reconciled into
durable order state.

## Authentication

Payment endpoints require a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

The webhook endpoint is unauthenticated by necessity and is protected by
HMAC signature verification instead.
        "#
    ),
    paths(
        crate::handlers::payments::create_payment,
        crate::handlers::payments::confirm_payment,
        crate::handlers::payment_webhooks::payment_webhook,
    ),
    components(schemas(
        crate::handlers::payments::CreatePaymentRequest,
        crate::handlers::payments::ConfirmPaymentRequest,
        crate::services::payments::PaymentInitiation,
        crate::services::payments::PaymentConfirmation,
        crate::services::payments::PaymentMethod,
        crate::services::payments::PaymentStatus,
        crate::errors::ErrorResponse,
    )),
    tags(
        (name = "Payments", description = "Payment lifecycle and gateway reconciliation")
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at /docs, serving the generated document.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_includes_the_payment_paths() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        assert!(paths.contains(&"/api/v1/payments".to_string()));
        assert!(paths.contains(&"/api/v1/payments/confirm".to_string()));
        assert!(paths.contains(&"/api/v1/payments/webhook".to_string()));
    }
}
