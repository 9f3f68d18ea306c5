//! HTTP endpoint handlers.
//!
//! The send endpoint only validates and enqueues; delivery happens in the
//! background consumer, so callers never learn whether the email went out.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use validator::Validate;

use crate::consumer::ConsumerState;
use crate::queue::{types::field_errors, EmailSendRequest, Publisher};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub queue: Arc<str>,
    pub consumer_state: watch::Receiver<ConsumerState>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        publisher: Publisher,
        queue: impl Into<Arc<str>>,
        consumer_state: watch::Receiver<ConsumerState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            publisher,
            queue: queue.into(),
            consumer_state,
            shutdown,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub consumer: &'static str,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let consumer = *state.consumer_state.borrow();
    Json(HealthResponse {
        status: "ok",
        consumer: consumer.as_str(),
    })
}

// =============================================================================
// Send Email
// =============================================================================

/// Body returned with a 400.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: BTreeMap<String, Vec<String>>,
}

fn bad_request(errors: BTreeMap<String, Vec<String>>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { errors })).into_response()
}

/// Email send endpoint.
///
/// 202 once the request is on the queue, 400 for an unreadable or invalid
/// request, 500 when the broker cannot be reached.
pub async fn send_email(
    State(state): State<AppState>,
    payload: Result<Json<EmailSendRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "email_request_unreadable");
            let mut errors = BTreeMap::new();
            errors.insert("$".to_string(), vec![rejection.body_text()]);
            return bad_request(errors);
        }
    };

    if let Err(e) = request.validate() {
        let errors = field_errors(&e);
        warn!(
            fields = ?errors.keys().collect::<Vec<_>>(),
            "email_request_invalid"
        );
        return bad_request(errors);
    }

    info!(to = %request.to, subject_length = request.subject.len(), "email_request_received");

    let cancel = state.shutdown.child_token();
    if let Err(e) = state
        .publisher
        .publish_request(&state.queue, &request, &cancel)
        .await
    {
        if e.is_cancelled() {
            warn!(error = %e, "email_publish_cancelled");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        error!(queue = %state.queue, error = %e, "email_publish_failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!(queue = %state.queue, to = %request.to, "email_enqueued");

    StatusCode::ACCEPTED.into_response()
}
