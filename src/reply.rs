//! Handlers behind the router: worker results out to the platform, user
//! messages acknowledged and forwarded to the worker.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    dedup::now_secs,
    error::{RelayError, Result},
    events::{EventEmitter, RelayEvent},
    intent::IntentApi,
    platform::PlatformApi,
    tasks::TaskDirectory,
    types::{
        IntentOutcome, IntentRequest, MessageContent, PlatformMessageEvent, ReceiveTarget, Upload,
    },
};

pub const DEFAULT_ACK_EMOJI: &str = "OnIt";

const ACTION_ASK: &str = "make-ask";
const ACTION_COMPLETE: &str = "complete";

#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub session: String,
    pub ack_emoji: String,
    /// Destination for results whose task id has no recorded origin.
    pub fallback: Option<ReceiveTarget>,
}

/// Final text of a `respond` detail, if it carries any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyText {
    pub text: String,
    /// The worker asked a question; the task stays open.
    pub awaiting_user: bool,
}

/// Collect `make-ask` questions/options and `complete` content from
/// `{actions: [...]}`. `None` when the response is not final yet.
pub fn extract_reply_text(detail: &Value) -> Option<ReplyText> {
    let actions = detail.get("actions")?.as_array()?;
    let mut fragments: Vec<String> = Vec::new();
    let mut saw_final = false;
    let mut awaiting_user = false;

    for action in actions {
        match action.get("type").and_then(Value::as_str) {
            Some(ACTION_ASK) => {
                saw_final = true;
                awaiting_user = true;
                if let Some(question) = action.get("question").map(value_text) {
                    fragments.push(question);
                }
                if let Some(options) = action.get("options").and_then(Value::as_array) {
                    let listed: Vec<String> = options
                        .iter()
                        .map(value_text)
                        .filter(|option| !option.is_empty())
                        .enumerate()
                        .map(|(idx, option)| format!("{}. {option}", idx + 1))
                        .collect();
                    if !listed.is_empty() {
                        fragments.push(listed.join("\n"));
                    }
                }
            }
            Some(ACTION_COMPLETE) => {
                saw_final = true;
                if let Some(content) = action.get("content").map(value_text) {
                    fragments.push(content);
                }
            }
            _ => {}
        }
    }

    if !saw_final {
        return None;
    }
    let text = fragments
        .into_iter()
        .filter(|fragment| !fragment.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if text.is_empty() {
        return None;
    }
    Some(ReplyText {
        text,
        awaiting_user,
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Null => String::new(),
        Value::Object(map) => ["label", "text", "content", "value"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

pub struct ReplyOrchestrator {
    platform: Arc<dyn PlatformApi>,
    intent: Arc<dyn IntentApi>,
    tasks: TaskDirectory,
    settings: ReplySettings,
    events: EventEmitter,
}

impl ReplyOrchestrator {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        intent: Arc<dyn IntentApi>,
        tasks: TaskDirectory,
        settings: ReplySettings,
        events: EventEmitter,
    ) -> Self {
        Self {
            platform,
            intent,
            tasks,
            settings,
            events,
        }
    }

    pub fn tasks(&self) -> &TaskDirectory {
        &self.tasks
    }

    /// Relay a worker `respond` to the conversation that started the task.
    /// Returns whether a reply was sent.
    pub async fn on_respond(&self, taskid: &str, detail: &Value) -> Result<bool> {
        let Some(reply) = extract_reply_text(detail) else {
            tracing::debug!(target = "feishu_relay::reply", taskid = %taskid, "respond not final; nothing sent");
            return Ok(false);
        };

        let origin = self.tasks.resolve(taskid, now_secs());
        let Some(target) = origin.clone().or_else(|| self.settings.fallback.clone()) else {
            tracing::warn!(target = "feishu_relay::reply", taskid = %taskid, "no reply destination for task");
            return Ok(false);
        };

        self.platform.send_text(&target, &reply.text).await?;
        if origin.is_some() && !reply.awaiting_user {
            self.tasks.forget(taskid);
        }
        tracing::info!(
            target = "feishu_relay::reply",
            taskid = %taskid,
            receive_id = %target.receive_id,
            "worker result relayed"
        );
        self.events.emit(RelayEvent::Reply {
            taskid: taskid.to_string(),
            receive_id: target.receive_id,
        });
        Ok(true)
    }

    pub async fn on_text_message(&self, event: &PlatformMessageEvent) {
        let content = event.message.content.intent_text();
        self.relay_user_message(event, content, Vec::new()).await;
    }

    pub async fn on_image_message(&self, event: &PlatformMessageEvent) {
        let uploads = match &event.message.content {
            MessageContent::Image { image_key } => vec![Upload {
                kind: "image".into(),
                key: image_key.clone(),
                name: None,
                message_id: event.message.message_id.clone(),
            }],
            _ => Vec::new(),
        };
        self.relay_user_message(event, String::new(), uploads).await;
    }

    pub async fn on_file_message(&self, event: &PlatformMessageEvent) {
        let uploads = match &event.message.content {
            MessageContent::File {
                file_key,
                file_name,
            } => vec![Upload {
                kind: "file".into(),
                key: file_key.clone(),
                name: Some(file_name.clone()).filter(|name| !name.is_empty()),
                message_id: event.message.message_id.clone(),
            }],
            _ => Vec::new(),
        };
        let content = event.message.content.intent_text();
        self.relay_user_message(event, content, uploads).await;
    }

    /// Failures stop here: they are logged with the user content and
    /// never reach the caller.
    async fn relay_user_message(
        &self,
        event: &PlatformMessageEvent,
        content: String,
        uploads: Vec<Upload>,
    ) {
        let request = IntentRequest {
            content,
            session: self.settings.session.clone(),
            uploads,
        };
        if let Err(error) = self.try_relay_user_message(event, &request).await {
            tracing::error!(
                target = "feishu_relay::reply",
                message_id = %event.message.message_id,
                content = %request.content,
                uploads = request.uploads.len(),
                error = %error,
                "failed to handle user message"
            );
        }
    }

    async fn try_relay_user_message(
        &self,
        event: &PlatformMessageEvent,
        request: &IntentRequest,
    ) -> Result<()> {
        let message_id = &event.message.message_id;
        let target = event
            .message
            .reply_target(&event.sender)
            .ok_or_else(|| RelayError::invalid("message has neither chat_id nor sender open_id"))?;

        if let Err(error) = self
            .platform
            .add_reaction(message_id, &self.settings.ack_emoji)
            .await
        {
            tracing::warn!(
                target = "feishu_relay::reply",
                message_id = %message_id,
                error = %error,
                "acknowledgement reaction failed"
            );
        }

        let response = self.intent.resolve(request).await;
        if let Some(taskid) = response.task_id() {
            self.tasks.remember(taskid, target.clone(), now_secs());
        }

        match response.outcome() {
            IntentOutcome::Error(errmsg) => {
                self.platform.send_text(&target, &errmsg).await?;
            }
            IntentOutcome::Reply(message) => {
                self.platform.send_text(&target, &message).await?;
            }
            IntentOutcome::React(emoji) => {
                self.platform.add_reaction(message_id, &emoji).await?;
            }
            IntentOutcome::Nothing => {
                tracing::debug!(target = "feishu_relay::reply", message_id = %message_id, "intent response carried nothing to relay");
            }
        }
        Ok(())
    }
}
