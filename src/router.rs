use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    dedup::{now_secs, Admission, SharedFilter},
    error::{RelayError, Result},
    events::{DropReason, EventEmitter, RelayEvent},
    reply::ReplyOrchestrator,
    types::{
        Action, CanonicalEvent, EventDetail, MessageKind, Method, PlatformMessage,
        PlatformMessageEvent, PlatformSender, RawPlatformMessage,
    },
};

/// Handler a worker event is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRoute {
    Errors,
    Respond,
    Control,
    Welcome,
    /// Recognized but not acted on.
    PassThrough,
    Unknown,
    /// Outside the `system`/`message` methods.
    Ignored,
}

pub fn worker_route(method: &Method, action: &Action) -> WorkerRoute {
    if matches!(method, Method::Other(_)) {
        return WorkerRoute::Ignored;
    }
    match action {
        Action::Errors => WorkerRoute::Errors,
        Action::Respond => WorkerRoute::Respond,
        Action::Control => WorkerRoute::Control,
        Action::Welcome if *method == Method::System => WorkerRoute::Welcome,
        Action::UserInput | Action::Stream | Action::Change => WorkerRoute::PassThrough,
        _ => WorkerRoute::Unknown,
    }
}

/// Lift a parsed worker frame into a canonical event. Non-object payloads
/// are logged and yield `None`.
pub fn normalize_worker_frame(frame: &Value) -> Option<CanonicalEvent> {
    let Some(map) = frame.as_object() else {
        tracing::warn!(target = "feishu_relay::router", payload = %frame, "unknown payload");
        return None;
    };
    let text = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let taskid = match map.get("taskid") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    };
    Some(CanonicalEvent {
        method: Method::parse(&text("method")),
        action: Action::parse(&text("action")),
        taskid,
        detail: EventDetail::Worker(map.get("detail").cloned().unwrap_or(Value::Null)),
    })
}

/// Validate the `event` body of an `im.message.receive_v1` push.
pub fn parse_platform_push(event: &Value) -> Result<PlatformMessageEvent> {
    let message = event
        .get("message")
        .cloned()
        .ok_or_else(|| RelayError::invalid("push carries no message"))?;
    let raw: RawPlatformMessage = serde_json::from_value(message)?;
    let sender: PlatformSender = match event.get("sender") {
        Some(sender) => serde_json::from_value(sender.clone())?,
        None => PlatformSender::default(),
    };
    Ok(PlatformMessageEvent {
        message: PlatformMessage::from_raw(raw)?,
        sender,
    })
}

pub fn normalize_platform_event(event: PlatformMessageEvent) -> CanonicalEvent {
    CanonicalEvent {
        method: Method::Message,
        action: Action::UserInput,
        taskid: String::new(),
        detail: EventDetail::Platform(event),
    }
}

pub struct Router {
    filter: SharedFilter,
    orchestrator: Arc<ReplyOrchestrator>,
    events: EventEmitter,
}

impl Router {
    pub fn new(
        filter: SharedFilter,
        orchestrator: Arc<ReplyOrchestrator>,
        events: EventEmitter,
    ) -> Self {
        Self {
            filter,
            orchestrator,
            events,
        }
    }

    pub fn filter(&self) -> &SharedFilter {
        &self.filter
    }

    /// Single consumer of the connection's inbound channel; frames are
    /// handled in arrival order until every sender is gone.
    pub async fn run(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Value>) {
        while let Some(frame) = inbound_rx.recv().await {
            self.dispatch_worker_value(&frame).await;
        }
        tracing::debug!(target = "feishu_relay::router", "inbound channel closed");
    }

    pub async fn dispatch_worker_value(&self, frame: &Value) -> Option<WorkerRoute> {
        let event = normalize_worker_frame(frame)?;
        Some(self.dispatch_worker(&event).await)
    }

    pub async fn dispatch_worker(&self, event: &CanonicalEvent) -> WorkerRoute {
        let route = worker_route(&event.method, &event.action);
        let null = Value::Null;
        let detail = event.worker_detail().unwrap_or(&null);
        match route {
            WorkerRoute::Errors => {
                tracing::error!(
                    target = "feishu_relay::router",
                    taskid = %event.taskid,
                    detail = %detail,
                    "worker reported error"
                );
            }
            WorkerRoute::Respond => {
                if let Err(error) = self.orchestrator.on_respond(&event.taskid, detail).await {
                    tracing::error!(
                        target = "feishu_relay::router",
                        taskid = %event.taskid,
                        error = %error,
                        "failed to relay worker result"
                    );
                }
            }
            WorkerRoute::Control => {
                tracing::info!(
                    target = "feishu_relay::router",
                    taskid = %event.taskid,
                    detail = %detail,
                    "worker control signal"
                );
            }
            WorkerRoute::Welcome => {
                tracing::info!(target = "feishu_relay::router", detail = %detail, "worker handshake complete");
            }
            WorkerRoute::PassThrough => {
                tracing::debug!(
                    target = "feishu_relay::router",
                    action = %event.action,
                    taskid = %event.taskid,
                    "pass-through action"
                );
            }
            WorkerRoute::Unknown => {
                tracing::warn!(
                    target = "feishu_relay::router",
                    method = %event.method,
                    action = %event.action,
                    "unknown action"
                );
            }
            WorkerRoute::Ignored => {}
        }
        route
    }

    pub async fn handle_platform_event(&self, event: PlatformMessageEvent) -> Admission {
        self.handle_platform_event_at(event, now_secs()).await
    }

    /// Filter a platform push on its message id and creation time, then run
    /// the per-type handler for admitted messages.
    pub async fn handle_platform_event_at(
        &self,
        event: PlatformMessageEvent,
        now_sec: i64,
    ) -> Admission {
        let message_id = event.message.message_id.clone();
        let admission = self
            .filter
            .check(&message_id, event.message.create_time_ms, now_sec);
        match admission {
            Admission::Duplicate => {
                tracing::info!(target = "feishu_relay::dedup", message_id = %message_id, "duplicate message dropped");
                self.events.emit(RelayEvent::Dedup {
                    message_id,
                    reason: DropReason::Duplicate,
                });
            }
            Admission::Stale => {
                tracing::info!(
                    target = "feishu_relay::dedup",
                    message_id = %message_id,
                    create_time_ms = event.message.create_time_ms,
                    "expired message dropped"
                );
                self.events.emit(RelayEvent::Dedup {
                    message_id,
                    reason: DropReason::Expired,
                });
            }
            Admission::Admitted => {
                self.dispatch_platform(&normalize_platform_event(event)).await;
            }
        }
        admission
    }

    async fn dispatch_platform(&self, event: &CanonicalEvent) {
        let EventDetail::Platform(push) = &event.detail else {
            return;
        };
        match &push.message.kind {
            MessageKind::Text => self.orchestrator.on_text_message(push).await,
            MessageKind::Image => self.orchestrator.on_image_message(push).await,
            MessageKind::File => self.orchestrator.on_file_message(push).await,
            MessageKind::Other(kind) => {
                tracing::debug!(
                    target = "feishu_relay::router",
                    message_id = %push.message.message_id,
                    message_type = %kind,
                    "unsupported message type ignored"
                );
            }
        }
    }
}
