//! HTTP registration API.
//!
//! | Route | Success | Errors |
//! |-------|---------|--------|
//! | `POST /trigger/push/subscribe` | `200` + trigger | `400` invalid or out of scope, `417` not persisted / not started |
//! | `POST /trigger/push/unsubscribe` | `200` | `400` empty id, `404` unknown, `417` not deleted |
//! | `GET /trigger/push/all` | `200` + object keyed by workflow id | |
//! | `GET /health` | `200` | |

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay::RegistrationService;
use serde_json::json;
use tracing::warn;
use triggers::{RegisteredTrigger, RelayError, RetryPolicy, SubscriptionRequest, UnsubscribeRequest};

struct AppState {
    service: RegistrationService,
}

pub fn router(service: RegistrationService) -> Router {
    Router::new()
        .route("/trigger/push/subscribe", post(subscribe))
        .route("/trigger/push/unsubscribe", post(unsubscribe))
        .route("/trigger/push/all", get(list_all))
        .route("/health", get(health))
        .with_state(Arc::new(AppState { service }))
}

struct ApiError(RelayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Validation(_) | RelayError::ScopeMismatch { .. } => StatusCode::BAD_REQUEST,
            RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::Storage { .. } | RelayError::ListenerStart { .. } => {
                StatusCode::EXPECTATION_FAILED
            }
        };
        if status == StatusCode::EXPECTATION_FAILED {
            warn!(error = %self.0, "registration request failed");
        }

        let mut body = json!({
            "error": self.0.to_string(),
            "retryable": matches!(self.0.retry_policy(), RetryPolicy::Retryable { .. }),
        });
        if let RelayError::Validation(errors) = &self.0 {
            body["details"] = json!(errors.iter().collect::<Vec<_>>());
        }
        (status, Json(body)).into_response()
    }
}

/// Connection strings carry shared access keys and never leave the process.
fn without_credential(mut trigger: RegisteredTrigger) -> RegisteredTrigger {
    trigger.record.connection_credential = None;
    trigger
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<RegisteredTrigger>, ApiError> {
    state
        .service
        .subscribe(&request)
        .await
        .map(|t| Json(without_credential(t)))
        .map_err(ApiError)
}

async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnsubscribeRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .unsubscribe(&request.workflow_id)
        .await
        .map(|()| StatusCode::OK)
        .map_err(ApiError)
}

async fn list_all(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, RegisteredTrigger>> {
    Json(
        state
            .service
            .list()
            .into_iter()
            .map(|t| (t.record.workflow_id.to_string(), without_credential(t)))
            .collect(),
    )
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let all = state.service.list();
    let listening = all.iter().filter(|t| t.is_listening()).count();
    Json(json!({
        "status": "ok",
        "triggers": all.len(),
        "listening": listening,
    }))
}
