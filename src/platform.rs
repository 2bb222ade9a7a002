//! Outbound calls to the chat platform open API.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{RelayError, Result},
    types::ReceiveTarget,
};

pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";

/// Refresh this long before the platform-reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const TOKEN_INVALID_CODES: [i64; 2] = [99991663, 99991668];

/// The reply surface the orchestrator drives.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Send a plain-text message; returns the new message id.
    async fn send_text(&self, target: &ReceiveTarget, text: &str) -> Result<String>;

    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct FeishuClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl FeishuClient {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    /// Tenant access token, fetched on first use and cached until near expiry.
    async fn ensure_token(&self) -> Result<String> {
        {
            let guard = self.token.lock();
            if let Some(cached) = guard.as_ref() {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.token.clone());
                }
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let res = self
            .http
            .post(&url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;
        let body: TokenResponse = res.json().await?;
        if body.code != 0 {
            return Err(RelayError::platform(body.code, body.msg));
        }
        let token = body
            .tenant_access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RelayError::invalid("no tenant_access_token in response"))?;

        let lifetime = Duration::from_secs(body.expire).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *self.token.lock() = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        tracing::debug!(target = "feishu_relay::platform", expire = body.expire, "tenant token refreshed");
        Ok(token)
    }

    fn invalidate_token(&self) {
        *self.token.lock() = None;
    }

    /// POST an authorized JSON request, retrying once if the token was rejected.
    async fn post_authorized(&self, url: &str, body: &Value) -> Result<Option<Value>> {
        match self.post_once(url, body).await {
            Err(RelayError::Platform { code, .. }) if TOKEN_INVALID_CODES.contains(&code) => {
                tracing::info!(target = "feishu_relay::platform", code, "tenant token rejected; refreshing");
                self.invalidate_token();
                self.post_once(url, body).await
            }
            other => other,
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Option<Value>> {
        let token = self.ensure_token().await?;
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(RelayError::platform(i64::from(status.as_u16()), text));
            }
            Err(error) => return Err(error.into()),
        };
        if envelope.code != 0 {
            return Err(RelayError::platform(envelope.code, envelope.msg));
        }
        if !status.is_success() {
            return Err(RelayError::platform(i64::from(status.as_u16()), envelope.msg));
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl PlatformApi for FeishuClient {
    async fn send_text(&self, target: &ReceiveTarget, text: &str) -> Result<String> {
        let url = format!(
            "{}/open-apis/im/v1/messages?receive_id_type={}",
            self.base_url,
            target.receive_id_type.as_str()
        );
        let content = json!({ "text": text }).to_string();
        let body = json!({
            "receive_id": target.receive_id,
            "msg_type": "text",
            "content": content,
            "uuid": Uuid::new_v4().to_string(),
        });
        let data = self.post_authorized(&url, &body).await?;
        let message_id = data
            .as_ref()
            .and_then(|data| data.get("message_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::debug!(
            target = "feishu_relay::platform",
            receive_id = %target.receive_id,
            message_id = %message_id,
            "text sent"
        );
        Ok(message_id)
    }

    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<()> {
        if message_id.is_empty() {
            return Err(RelayError::invalid("message_id is required"));
        }
        if emoji_type.is_empty() {
            return Err(RelayError::invalid("emoji_type is required"));
        }
        let url = format!(
            "{}/open-apis/im/v1/messages/{}/reactions",
            self.base_url, message_id
        );
        let body = json!({ "reaction_type": { "emoji_type": emoji_type } });
        self.post_authorized(&url, &body).await?;
        Ok(())
    }
}
