//! Web server module for the HTTP entry point.
//!
//! A thin layer that validates send requests and hands them to the publisher.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{health, send_email, AppState, ErrorResponse, HealthResponse};

/// Route for submitting email send requests.
pub const SEND_EMAIL_ROUTE: &str = "/api/EmailSender";

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(SEND_EMAIL_ROUTE, post(send_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::config::BrokerConfig;
    use crate::consumer::ConsumerState;
    use crate::queue::{AmqpConnector, ConnectionManager, Publisher};

    fn app() -> Router {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BrokerConfig::default()
        };
        let connections = Arc::new(ConnectionManager::new(AmqpConnector::new(config)));
        let publisher = Publisher::new(connections);
        let (_, consumer_state) = watch::channel(ConsumerState::Consuming);
        router(AppState::new(
            publisher,
            "email-sender",
            consumer_state,
            CancellationToken::new(),
        ))
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(SEND_EMAIL_ROUTE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_consumer_state() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["consumer"], "consuming");
    }

    #[tokio::test]
    async fn test_invalid_request_returns_field_errors() {
        let response = app()
            .oneshot(post_json(
                r#"{"To":"email-invalido","ToName":"","Subject":"Hi","Body":"Hello"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["errors"]["To"].is_array());
        assert!(body["errors"]["ToName"].is_array());
        assert!(body["errors"].get("Subject").is_none());
    }

    #[tokio::test]
    async fn test_unreadable_json_returns_bad_request() {
        let response = app().oneshot(post_json("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_failure_returns_server_error() {
        let response = app()
            .oneshot(post_json(
                r#"{"To":"a@b.com","ToName":"A","Subject":"Hi","Body":"Hello"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
