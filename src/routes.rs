//! HTTP host layer: webhook endpoints plus read-mostly operator endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{FromRequest, Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::{DatabaseError, Error, ValidationError};
use crate::pipeline::types::{RawPayload, WebhookOutcome};
use crate::pipeline::{OutboundDispatcher, WebhookReceiver};
use crate::store::{ConversationStore, DeliveryStatus};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<WebhookReceiver>,
    pub store: Arc<dyn ConversationStore>,
    pub dispatcher: Arc<OutboundDispatcher>,
    /// Organization for `POST /webhooks/messaging` without a path segment.
    pub default_organization: String,
    /// Bearer token for `/api/*`. Open when `None`.
    pub operator_token: Option<SecretString>,
}

/// Build the Axum router with webhook and operator routes.
pub fn app_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    let operator = Router::new()
        .route("/api/clients/{id}", get(get_client))
        .route(
            "/api/clients/{id}/messages",
            get(list_client_messages).post(send_client_message),
        )
        .route("/api/messages/failed", get(list_failed_messages))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/messaging", post(webhook_default_org))
        .route("/webhooks/messaging/{organization_id}", post(webhook_for_org))
        .merge(operator)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "autoreply"
    }))
}

// ── Webhooks ────────────────────────────────────────────────────────────

/// Webhook body as a flat JSON object; form posts become string fields.
pub struct WebhookBody(pub RawPayload);

impl<S: Send + Sync> FromRequest<S> for WebhookBody {
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| malformed(&e.body_text()))?;
            return Ok(Self(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect(),
            ));
        }

        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|e| malformed(&e.body_text()))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(malformed("expected a JSON object")),
        }
    }
}

fn malformed(detail: &str) -> Response {
    rejected_response(&ValidationError::Malformed(detail.to_string())).into_response()
}

fn rejected_response(e: &ValidationError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "status": "rejected",
            "reason": e.code(),
            "detail": e.to_string(),
        })),
    )
}

fn webhook_response(result: Result<WebhookOutcome, DatabaseError>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(WebhookOutcome::Accepted {
            client_id,
            message_id,
            reply,
        }) => {
            let mut body = json!({
                "status": "accepted",
                "client_id": client_id,
                "message_id": message_id,
            });
            if let Some(report) = reply {
                body["reply"] = json!({
                    "outcome": report.outcome(),
                    "report": report,
                });
            }
            (StatusCode::OK, Json(body))
        }
        Ok(WebhookOutcome::Duplicate { .. }) => {
            (StatusCode::OK, Json(json!({"status": "duplicate"})))
        }
        Ok(WebhookOutcome::Rejected(e)) => rejected_response(&e),
        Err(e) => {
            error!(error = %e, "Webhook storage failure");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "error", "reason": "storage_unavailable"})),
            )
        }
    }
}

async fn webhook_default_org(
    State(state): State<AppState>,
    WebhookBody(payload): WebhookBody,
) -> impl IntoResponse {
    let result = state
        .receiver
        .handle(&state.default_organization, &payload)
        .await;
    webhook_response(result)
}

async fn webhook_for_org(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    WebhookBody(payload): WebhookBody,
) -> impl IntoResponse {
    let result = state.receiver.handle(&organization_id, &payload).await;
    webhook_response(result)
}

// ── Operator auth ───────────────────────────────────────────────────────

async fn require_operator(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.operator_token.as_ref() else {
        return next.run(request).await;
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.expose_secret().as_bytes())) => {
            next.run(request).await
        }
        _ => {
            warn!(path = %request.uri().path(), "Operator request without valid token");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing or invalid operator token"})),
            )
                .into_response()
        }
    }
}

// ── Operator endpoints ──────────────────────────────────────────────────

fn storage_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error!(error = %e, "Operator request storage failure");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "Storage unavailable"})),
    )
}

fn client_not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Client not found"})),
    )
}

async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_client(&id).await {
        Ok(Some(client)) => (StatusCode::OK, Json(json!(client))),
        Ok(None) => client_not_found(),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

async fn list_client_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> impl IntoResponse {
    match state.store.get_client(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return client_not_found(),
        Err(e) => return storage_error(e),
    }

    match state
        .store
        .list_messages(&id, page.offset.unwrap_or(0), page.limit())
        .await
    {
        Ok(messages) => (StatusCode::OK, Json(json!(messages))),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    body: String,
}

async fn send_client_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> impl IntoResponse {
    let client = match state.store.get_client(&id).await {
        Ok(Some(client)) => client,
        Ok(None) => return client_not_found(),
        Err(e) => return storage_error(e),
    };

    match state.dispatcher.send_manual(&client, &request.body).await {
        Ok((message, delivery)) => {
            let status = if delivery.is_sent() {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            (status, Json(json!({"message": message, "delivery": delivery})))
        }
        Err(Error::Validation(e)) => rejected_response(&e),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct FailedQuery {
    limit: Option<usize>,
}

async fn list_failed_messages(
    State(state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    match state
        .store
        .messages_with_status(DeliveryStatus::Failed, limit)
        .await
    {
        Ok(messages) => (StatusCode::OK, Json(json!(messages))),
        Err(e) => storage_error(e),
    }
}
