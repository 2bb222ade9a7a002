use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Worker,
    Platform,
}

/// Envelope `method` of the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    System,
    Message,
    Other(String),
}

impl Method {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "system" => Self::System,
            "message" => Self::Message,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::Message => "message",
            Self::Other(other) => other,
        }
    }
}

/// Envelope `action` of the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Hello,
    Welcome,
    Errors,
    Respond,
    Control,
    UserInput,
    Stream,
    Change,
    Other(String),
}

impl Action {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "hello" => Self::Hello,
            "welcome" => Self::Welcome,
            "errors" => Self::Errors,
            "respond" => Self::Respond,
            "control" => Self::Control,
            "user-input" => Self::UserInput,
            "stream" => Self::Stream,
            "change" => Self::Change,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Hello => "hello",
            Self::Welcome => "welcome",
            Self::Errors => "errors",
            Self::Respond => "respond",
            Self::Control => "control",
            Self::UserInput => "user-input",
            Self::Stream => "stream",
            Self::Change => "change",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a canonical event. The variant fixes the event's source.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDetail {
    Worker(Value),
    Platform(PlatformMessageEvent),
}

/// The normalized `{source, method, action, taskid, detail}` envelope both
/// directions of traffic are routed through.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub method: Method,
    pub action: Action,
    /// Empty when the frame carried no task id.
    pub taskid: String,
    pub detail: EventDetail,
}

impl CanonicalEvent {
    pub fn source(&self) -> EventSource {
        match self.detail {
            EventDetail::Worker(_) => EventSource::Worker,
            EventDetail::Platform(_) => EventSource::Platform,
        }
    }

    pub fn worker_detail(&self) -> Option<&Value> {
        match &self.detail {
            EventDetail::Worker(value) => Some(value),
            EventDetail::Platform(_) => None,
        }
    }
}

/// Platform `message_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    File,
    Other(String),
}

impl MessageKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" => Self::Text,
            "image" => Self::Image,
            "file" => Self::File,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Other(other) => other,
        }
    }
}

/// Decoded `content` of a platform message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text { text: String },
    Image { image_key: String },
    File { file_key: String, file_name: String },
    Unsupported { raw: String },
}

impl MessageContent {
    /// Decode the JSON-encoded `content` string for the given message kind.
    pub fn decode(kind: &MessageKind, raw: &str) -> Result<Self> {
        if let MessageKind::Other(_) = kind {
            return Ok(Self::Unsupported {
                raw: raw.to_string(),
            });
        }
        let value: Value = serde_json::from_str(raw)?;
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .ok_or_else(|| {
                    RelayError::invalid(format!("{} content missing `{key}`", kind.as_str()))
                })
        };
        Ok(match kind {
            MessageKind::Text => Self::Text {
                text: field("text")?,
            },
            MessageKind::Image => Self::Image {
                image_key: field("image_key")?,
            },
            _ => Self::File {
                file_key: field("file_key")?,
                file_name: field("file_name").unwrap_or_default(),
            },
        })
    }

    /// Text forwarded to the worker as the intent `content`.
    pub fn intent_text(&self) -> String {
        match self {
            Self::Text { text } => text.trim().to_string(),
            Self::Image { .. } | Self::Unsupported { .. } => String::new(),
            Self::File { file_name, .. } => file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderId {
    #[serde(default)]
    pub open_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub union_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSender {
    #[serde(default)]
    pub sender_id: SenderId,
    #[serde(default)]
    pub sender_type: Option<String>,
    #[serde(default)]
    pub tenant_key: Option<String>,
}

/// Message object as delivered inside an `im.message.receive_v1` push.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPlatformMessage {
    pub message_id: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub chat_type: Option<String>,
    #[serde(deserialize_with = "millis_from_string_or_number")]
    pub create_time: i64,
    pub message_type: String,
    #[serde(default)]
    pub content: String,
}

/// A validated platform message. `create_time_ms` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMessage {
    pub message_id: String,
    pub chat_id: Option<String>,
    pub chat_type: Option<String>,
    pub create_time_ms: i64,
    pub kind: MessageKind,
    pub content: MessageContent,
}

impl PlatformMessage {
    pub fn from_raw(raw: RawPlatformMessage) -> Result<Self> {
        if raw.message_id.trim().is_empty() {
            return Err(RelayError::invalid("message_id is empty"));
        }
        let kind = MessageKind::parse(&raw.message_type);
        let content = MessageContent::decode(&kind, &raw.content)?;
        Ok(Self {
            message_id: raw.message_id,
            chat_id: raw.chat_id.filter(|id| !id.is_empty()),
            chat_type: raw.chat_type,
            create_time_ms: raw.create_time,
            kind,
            content,
        })
    }

    /// Conversation that replies to this message go to.
    pub fn reply_target(&self, sender: &PlatformSender) -> Option<ReceiveTarget> {
        if let Some(chat_id) = &self.chat_id {
            return Some(ReceiveTarget::new(chat_id.clone(), ReceiveIdType::ChatId));
        }
        sender
            .sender_id
            .open_id
            .clone()
            .map(|open_id| ReceiveTarget::new(open_id, ReceiveIdType::OpenId))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformMessageEvent {
    pub message: PlatformMessage,
    pub sender: PlatformSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveIdType {
    OpenId,
    UserId,
    UnionId,
    Email,
    ChatId,
}

impl ReceiveIdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenId => "open_id",
            Self::UserId => "user_id",
            Self::UnionId => "union_id",
            Self::Email => "email",
            Self::ChatId => "chat_id",
        }
    }
}

impl std::str::FromStr for ReceiveIdType {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim() {
            "open_id" => Ok(Self::OpenId),
            "user_id" => Ok(Self::UserId),
            "union_id" => Ok(Self::UnionId),
            "email" => Ok(Self::Email),
            "chat_id" => Ok(Self::ChatId),
            other => Err(format!("unknown receive_id_type `{other}`")),
        }
    }
}

/// Where a platform reply is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiveTarget {
    pub receive_id: String,
    pub receive_id_type: ReceiveIdType,
}

impl ReceiveTarget {
    pub fn new(receive_id: impl Into<String>, receive_id_type: ReceiveIdType) -> Self {
        Self {
            receive_id: receive_id.into(),
            receive_id_type,
        }
    }
}

/// Platform resource referenced by a forwarded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message_id: String,
}

/// Body of `POST /api/intent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentRequest {
    pub content: String,
    pub session: String,
    pub uploads: Vec<Upload>,
}

/// Response of `POST /api/intent`. Failures carry only `errmsg`.
///
/// Scalar fields accept strings or numbers; the worker emits numeric task
/// ids as readily as string ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentResponse {
    #[serde(default, deserialize_with = "opt_text")]
    pub intent: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub taskid: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub worker: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub emoji: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub errmsg: Option<String>,
}

/// What the relay does with an intent response, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    Error(String),
    Reply(String),
    React(String),
    Nothing,
}

impl IntentResponse {
    pub fn error(errmsg: impl Into<String>) -> Self {
        Self {
            errmsg: Some(errmsg.into()),
            ..Self::default()
        }
    }

    pub fn outcome(&self) -> IntentOutcome {
        fn present(field: &Option<String>) -> Option<&str> {
            field.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }
        if let Some(errmsg) = present(&self.errmsg) {
            return IntentOutcome::Error(errmsg.to_string());
        }
        if let Some(message) = present(&self.message) {
            return IntentOutcome::Reply(message.to_string());
        }
        if let Some(emoji) = present(&self.emoji) {
            return IntentOutcome::React(emoji.to_string());
        }
        IntentOutcome::Nothing
    }

    pub fn task_id(&self) -> Option<&str> {
        self.taskid.as_deref().filter(|id| !id.is_empty())
    }
}

/// Text of a string or scalar field; `null` reads as absent and structured
/// values keep their JSON text.
fn opt_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn millis_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom("create_time out of range")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("create_time `{s}` is not a number"))),
        other => Err(D::Error::custom(format!(
            "create_time must be a string or number, got {other}"
        ))),
    }
}
