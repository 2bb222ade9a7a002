//! HTTP entry point for platform event pushes.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing, Json, Router};
use serde_json::{json, Value};

use crate::{connection::ConnectionManager, router, router::Router as EventRouter};

const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";

#[derive(Clone)]
struct WebhookState {
    router: Arc<EventRouter>,
    connection: Arc<ConnectionManager>,
    verification_token: Option<String>,
}

impl WebhookState {
    fn token_matches(&self, presented: Option<&str>) -> bool {
        match self.verification_token.as_deref() {
            Some(expected) => presented == Some(expected),
            None => true,
        }
    }
}

pub fn webhook_router(
    router: Arc<EventRouter>,
    connection: Arc<ConnectionManager>,
    verification_token: Option<String>,
) -> Router {
    let state = WebhookState {
        router,
        connection,
        verification_token: verification_token.filter(|token| !token.is_empty()),
    };
    Router::new()
        .route("/health", routing::get(health))
        .route("/feishu/event", routing::post(feishu_event))
        .with_state(state)
}

async fn health(State(state): State<WebhookState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "feishu-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "workerConnected": state.connection.is_connected(),
        "droppedFrames": state.connection.dropped_frames(),
    }))
}

async fn feishu_event(
    State(state): State<WebhookState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if body.get("encrypt").is_some() {
        tracing::warn!(target = "feishu_relay::webhook", "encrypted push rejected");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "encrypted events are not supported" })),
        );
    }

    if body.get("type").and_then(Value::as_str) == Some("url_verification") {
        if !state.token_matches(body.get("token").and_then(Value::as_str)) {
            return unauthorized();
        }
        let challenge = body.get("challenge").cloned().unwrap_or(Value::Null);
        return (StatusCode::OK, Json(json!({ "challenge": challenge })));
    }

    let header = body.get("header");
    let token = header
        .and_then(|header| header.get("token"))
        .and_then(Value::as_str);
    if !state.token_matches(token) {
        return unauthorized();
    }

    let event_type = header
        .and_then(|header| header.get("event_type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if event_type != MESSAGE_RECEIVE_EVENT {
        tracing::debug!(target = "feishu_relay::webhook", event_type = %event_type, "event type ignored");
        return (StatusCode::OK, Json(json!({})));
    }

    let event = body.get("event").cloned().unwrap_or(Value::Null);
    match router::parse_platform_push(&event) {
        Ok(push) => {
            let router = Arc::clone(&state.router);
            tokio::spawn(async move {
                router.handle_platform_event(push).await;
            });
        }
        Err(error) => {
            tracing::warn!(
                target = "feishu_relay::webhook",
                error = %error,
                event = %event,
                "invalid message push dropped"
            );
        }
    }
    (StatusCode::OK, Json(json!({})))
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    tracing::warn!(target = "feishu_relay::webhook", "verification token mismatch");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "verification token mismatch" })),
    )
}
