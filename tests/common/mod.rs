use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    middleware, Router,
};
use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use serde_json::Value;
use storefront_api::{
    api_v1_routes,
    auth::{consts as perm, AuthConfig, AuthService},
    config::AppConfig,
    db,
    entities::{order, processed_webhook_event},
    events::{self, EventSender},
    gateway::{GatewayError, PaymentGateway, PaymentIntent},
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

/// Deterministic stand-in for the external payment gateway.
pub struct MockGateway {
    intent_counter: AtomicUsize,
    /// (amount_minor, currency) per create_intent call
    pub created: Mutex<Vec<(i64, String)>>,
    pub retrieve_status: Mutex<String>,
    pub retrieve_amount: Mutex<i64>,
    /// When set, every call answers with a transport error
    pub unavailable: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            intent_counter: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            retrieve_status: Mutex::new("requires_confirmation".to_string()),
            retrieve_amount: Mutex::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    #[allow(dead_code)]
    pub fn create_calls(&self) -> usize {
        self.created.lock().expect("gateway mutex").len()
    }

    #[allow(dead_code)]
    pub fn set_retrieve(&self, status: &str, amount_minor: i64) {
        *self.retrieve_status.lock().expect("gateway mutex") = status.to_string();
        *self.retrieve_amount.lock().expect("gateway mutex") = amount_minor;
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }

        let n = self.intent_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.created
            .lock()
            .expect("gateway mutex")
            .push((amount_minor, currency.to_string()));

        Ok(PaymentIntent {
            id: format!("pi_test_{}", n),
            status: "requires_confirmation".to_string(),
            amount_minor,
            client_secret: Some(format!("pi_test_{}_secret", n)),
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }

        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status: self.retrieve_status.lock().expect("gateway mutex").clone(),
            amount_minor: *self.retrieve_amount.lock().expect("gateway mutex"),
            client_secret: None,
        })
    }
}

/// Helper harness spinning up application state backed by an in-memory
/// SQLite database and a mock gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    #[allow(dead_code)]
    pub auth_service: Arc<AuthService>,
    token: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application after tweaking the configuration.
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
            3600,
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // A single pooled connection keeps the in-memory database alive
        // and shared across the whole test.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.auto_migrate = true;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::ensure_schema(&pool)
            .await
            .expect("failed to create test schema");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(MockGateway::new());

        let auth_service = Arc::new(AuthService::new(AuthConfig::new(
            cfg.jwt_secret.clone(),
            cfg.auth_issuer.clone(),
            cfg.auth_audience.clone(),
            Duration::from_secs(cfg.jwt_expiration as u64),
        )));

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            gateway: gateway.clone() as Arc<dyn PaymentGateway>,
            redis: None,
        };

        let token = auth_service
            .issue_token(
                &Uuid::new_v4().to_string(),
                &["admin"],
                &[perm::PAYMENTS_READ, perm::PAYMENTS_WRITE],
            )
            .expect("issue test token");

        let auth_service_for_layer = auth_service.clone();
        let api_router = api_v1_routes().layer(middleware::from_fn_with_state(
            auth_service_for_layer,
            |axum::extract::State(auth): axum::extract::State<Arc<AuthService>>,
             mut req: Request<Body>,
             next: axum::middleware::Next| async move {
                req.extensions_mut().insert(auth);
                next.run(req).await
            },
        ));

        let router = Router::new()
            .nest("/api/v1", api_router)
            .with_state(state.clone());

        Self {
            router,
            state,
            gateway,
            auth_service,
            token,
            _event_task: event_task,
        }
    }

    /// Access the bearer token for the default admin user.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Convenience helper for authenticated JSON requests.
    pub async fn request_authenticated(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        self.request(method, uri, body, Some(self.token())).await
    }

    /// Send a raw-body request with arbitrary headers (webhook deliveries).
    #[allow(dead_code)]
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = builder
            .body(Body::from(body))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Insert an order the way the upstream order-placement flow would.
    pub async fn seed_order(
        &self,
        payment_status: &str,
        gateway_intent_id: Option<&str>,
    ) -> order::Model {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let model = order::ActiveModel {
            id: Set(id),
            order_number: Set(format!(
                "ORD-{}",
                id.to_string()[..8].to_uppercase()
            )),
            customer_id: Set(Uuid::new_v4()),
            status: Set("pending".to_string()),
            order_date: Set(now),
            total_amount: Set(dec!(50.00)),
            currency: Set("USD".to_string()),
            payment_status: Set(payment_status.to_string()),
            payment_method: Set(None),
            gateway_intent_id: Set(gateway_intent_id.map(|s| s.to_string())),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
            version: Set(1),
        };

        model
            .insert(&*self.state.db)
            .await
            .expect("seed order for tests")
    }

    /// Link an order to a gateway intent, simulating the order-placement
    /// collaborator persisting the intent id.
    #[allow(dead_code)]
    pub async fn set_gateway_intent(&self, order_id: Uuid, intent_id: &str) {
        let order = self.fetch_order(order_id).await;
        let mut active: order::ActiveModel = order.into();
        active.gateway_intent_id = Set(Some(intent_id.to_string()));
        active
            .update(&*self.state.db)
            .await
            .expect("link gateway intent");
    }

    pub async fn fetch_order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    #[allow(dead_code)]
    pub async fn processed_event_count(&self) -> u64 {
        processed_webhook_event::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count processed events")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Decode a response body into JSON.
pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
