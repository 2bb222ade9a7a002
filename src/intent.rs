//! Forwarding user content to the worker.
//!
//! Both forwarders fold every failure into an `errmsg` response, so the
//! orchestrator only ever branches on the response shape.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;

use crate::{
    connection::ConnectionManager,
    error::RelayError,
    types::{IntentRequest, IntentResponse},
};

pub const DEFAULT_INTENT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_SESSION: &str = "feishu-bot";

#[async_trait]
pub trait IntentApi: Send + Sync {
    async fn resolve(&self, request: &IntentRequest) -> IntentResponse;
}

/// `POST /api/intent` on the worker host.
#[derive(Clone)]
pub struct WorkerHttpClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl WorkerHttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl IntentApi for WorkerHttpClient {
    async fn resolve(&self, request: &IntentRequest) -> IntentResponse {
        let url = format!("{}/api/intent", self.base_url);
        tracing::info!(
            target = "feishu_relay::intent",
            content = %request.content,
            uploads = request.uploads.len(),
            "intent request"
        );

        let res = match self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
        {
            Ok(res) => res,
            Err(error) => return IntentResponse::error(error.to_string()),
        };

        let status = res.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unknown");
            return IntentResponse::error(format!("Req err: {reason}"));
        }

        let response = match res.json::<IntentResponse>().await {
            Ok(response) => response,
            Err(error) => IntentResponse::error(error.to_string()),
        };
        tracing::info!(
            target = "feishu_relay::intent",
            taskid = response.taskid.as_deref().unwrap_or(""),
            intent = response.intent.as_deref().unwrap_or(""),
            errmsg = response.errmsg.as_deref().unwrap_or(""),
            "intent response"
        );
        response
    }
}

/// Pushes user content over the worker socket as a `message/user-input`
/// envelope. Results come back asynchronously as `respond` frames.
#[derive(Clone)]
pub struct SocketForwarder {
    connection: Arc<ConnectionManager>,
}

impl SocketForwarder {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl IntentApi for SocketForwarder {
    async fn resolve(&self, request: &IntentRequest) -> IntentResponse {
        let envelope = json!({
            "method": "message",
            "action": "user-input",
            "detail": request,
        });
        if self.connection.send_json(&envelope).await {
            IntentResponse::default()
        } else {
            IntentResponse::error(RelayError::NotConnected.to_string())
        }
    }
}
