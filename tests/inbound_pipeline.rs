use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use feishu_relay::{
    connection::ConnectionOptions,
    context::{ContextSettings, RelayContext},
    dedup::{now_secs, Admission, FilterSettings},
    error::{RelayError, Result},
    intent::IntentApi,
    platform::PlatformApi,
    reply::ReplySettings,
    router::{parse_platform_push, WorkerRoute},
    types::{IntentRequest, IntentResponse, PlatformMessageEvent, ReceiveIdType, ReceiveTarget},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingPlatform {
    texts: Mutex<Vec<(ReceiveTarget, String)>>,
    reactions: Mutex<Vec<(String, String)>>,
    fail_sends: AtomicBool,
}

impl RecordingPlatform {
    fn texts(&self) -> Vec<(ReceiveTarget, String)> {
        self.texts.lock().clone()
    }

    fn reactions(&self) -> Vec<(String, String)> {
        self.reactions.lock().clone()
    }
}

#[async_trait]
impl PlatformApi for RecordingPlatform {
    async fn send_text(&self, target: &ReceiveTarget, text: &str) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RelayError::platform(230001, "invalid receive_id"));
        }
        let mut texts = self.texts.lock();
        texts.push((target.clone(), text.to_string()));
        Ok(format!("om_reply_{}", texts.len()))
    }

    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<()> {
        self.reactions
            .lock()
            .push((message_id.to_string(), emoji_type.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedWorker {
    response: Mutex<IntentResponse>,
    requests: Mutex<Vec<IntentRequest>>,
}

impl ScriptedWorker {
    fn respond_with(&self, response: IntentResponse) {
        *self.response.lock() = response;
    }

    fn requests(&self) -> Vec<IntentRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl IntentApi for ScriptedWorker {
    async fn resolve(&self, request: &IntentRequest) -> IntentResponse {
        self.requests.lock().push(request.clone());
        self.response.lock().clone()
    }
}

struct Harness {
    ctx: RelayContext,
    platform: Arc<RecordingPlatform>,
    worker: Arc<ScriptedWorker>,
}

fn ops_destination() -> ReceiveTarget {
    ReceiveTarget::new("ops@example.com", ReceiveIdType::Email)
}

fn harness() -> Harness {
    let platform = Arc::new(RecordingPlatform::default());
    let worker = Arc::new(ScriptedWorker::default());
    let settings = ContextSettings {
        connection: ConnectionOptions::new("ws://127.0.0.1:9/socket"),
        filter: FilterSettings::default(),
        reply: ReplySettings {
            session: "feishu-bot".into(),
            ack_emoji: "OnIt".into(),
            fallback: Some(ops_destination()),
        },
        inbound_capacity: 16,
        json_output: false,
    };
    let intent = worker.clone();
    let (ctx, _inbound_rx) = RelayContext::assemble(settings, platform.clone(), move |_| {
        let intent: Arc<dyn IntentApi> = intent;
        intent
    });
    Harness {
        ctx,
        platform,
        worker,
    }
}

fn push(message_id: &str, created_ms: i64, message_type: &str, content: Value) -> PlatformMessageEvent {
    parse_platform_push(&json!({
        "sender": {"sender_id": {"open_id": "ou_alice"}, "sender_type": "user"},
        "message": {
            "message_id": message_id,
            "chat_id": "oc_team",
            "chat_type": "group",
            "create_time": created_ms.to_string(),
            "message_type": message_type,
            "content": content.to_string()
        }
    }))
    .unwrap()
}

fn text_push(message_id: &str, created_ms: i64, text: &str) -> PlatformMessageEvent {
    push(message_id, created_ms, "text", json!({ "text": text }))
}

fn team_chat() -> ReceiveTarget {
    ReceiveTarget::new("oc_team", ReceiveIdType::ChatId)
}

#[tokio::test]
async fn worker_respond_sends_one_reply_to_configured_destination() {
    let h = harness();
    let route = h
        .ctx
        .router
        .dispatch_worker_value(&json!({
            "method": "message",
            "action": "respond",
            "taskid": "t1",
            "detail": {"actions": [{"type": "complete", "content": "Hello"}]}
        }))
        .await;

    assert_eq!(route, Some(WorkerRoute::Respond));
    assert_eq!(h.platform.texts(), vec![(ops_destination(), "Hello".to_string())]);
}

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_and_forwarded_once() {
    let h = harness();
    let now = now_secs();
    let created = now * 1000;

    let first = h
        .ctx
        .router
        .handle_platform_event_at(text_push("m1", created, "status?"), now)
        .await;
    let second = h
        .ctx
        .router
        .handle_platform_event_at(text_push("m1", created, "status?"), now + 1)
        .await;

    assert_eq!(first, Admission::Admitted);
    assert_eq!(second, Admission::Duplicate);
    assert_eq!(h.platform.reactions(), vec![("m1".to_string(), "OnIt".to_string())]);
    assert_eq!(h.worker.requests().len(), 1);
    assert_eq!(h.worker.requests()[0].content, "status?");
    assert_eq!(h.worker.requests()[0].session, "feishu-bot");
}

#[tokio::test]
async fn expired_message_is_dropped_without_side_effects() {
    let h = harness();
    let now = now_secs();
    let twenty_minutes_ago = (now - 20 * 60) * 1000;

    let admission = h
        .ctx
        .router
        .handle_platform_event_at(text_push("m2", twenty_minutes_ago, "old"), now)
        .await;

    assert_eq!(admission, Admission::Stale);
    assert!(h.platform.reactions().is_empty());
    assert!(h.worker.requests().is_empty());
    assert!(h.ctx.filter.is_empty());
}

#[tokio::test]
async fn worker_errmsg_is_relayed_to_the_user() {
    let h = harness();
    h.worker.respond_with(IntentResponse::error("timeout"));
    let now = now_secs();

    h.ctx
        .router
        .handle_platform_event_at(text_push("m3", now * 1000, "draft the memo"), now)
        .await;

    assert_eq!(h.platform.texts(), vec![(team_chat(), "timeout".to_string())]);

    // The read path keeps going afterwards.
    let (tx, rx) = mpsc::channel(4);
    let router = tokio::spawn(h.ctx.router.clone().run(rx));
    tx.send(json!({
        "method": "message",
        "action": "respond",
        "taskid": "t-late",
        "detail": {"actions": [{"type": "complete", "content": "done"}]}
    }))
    .await
    .unwrap();
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), router)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.platform.texts().len(), 2);
}

#[tokio::test]
async fn worker_result_returns_to_originating_chat() {
    let h = harness();
    h.worker.respond_with(IntentResponse {
        taskid: Some("t9".into()),
        emoji: Some("THUMBSUP".into()),
        ..IntentResponse::default()
    });
    let now = now_secs();

    h.ctx
        .router
        .handle_platform_event_at(text_push("m4", now * 1000, "summarize"), now)
        .await;
    assert_eq!(
        h.platform.reactions(),
        vec![
            ("m4".to_string(), "OnIt".to_string()),
            ("m4".to_string(), "THUMBSUP".to_string())
        ]
    );

    h.ctx
        .router
        .dispatch_worker_value(&json!({
            "method": "message",
            "action": "respond",
            "taskid": "t9",
            "detail": {"actions": [{"type": "complete", "content": "Summary ready"}]}
        }))
        .await;

    assert_eq!(
        h.platform.texts(),
        vec![(team_chat(), "Summary ready".to_string())]
    );
    assert!(h.ctx.tasks.is_empty());
}

#[tokio::test]
async fn failed_reply_does_not_block_later_messages() {
    let h = harness();
    h.worker.respond_with(IntentResponse {
        message: Some("on it".into()),
        ..IntentResponse::default()
    });
    let now = now_secs();

    h.platform.fail_sends.store(true, Ordering::SeqCst);
    h.ctx
        .router
        .handle_platform_event_at(text_push("m5", now * 1000, "one"), now)
        .await;
    assert!(h.platform.texts().is_empty());

    h.platform.fail_sends.store(false, Ordering::SeqCst);
    h.ctx
        .router
        .handle_platform_event_at(text_push("m6", now * 1000, "two"), now)
        .await;
    assert_eq!(h.platform.texts(), vec![(team_chat(), "on it".to_string())]);
    assert_eq!(h.worker.requests().len(), 2);
}

#[tokio::test]
async fn image_and_file_messages_forward_uploads() {
    let h = harness();
    let now = now_secs();

    h.ctx
        .router
        .handle_platform_event_at(
            push("m7", now * 1000, "image", json!({"image_key": "img_v2_1"})),
            now,
        )
        .await;
    h.ctx
        .router
        .handle_platform_event_at(
            push(
                "m8",
                now * 1000,
                "file",
                json!({"file_key": "file_v2_1", "file_name": "q3.pdf"}),
            ),
            now,
        )
        .await;

    let requests = h.worker.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].content, "");
    assert_eq!(requests[0].uploads[0].kind, "image");
    assert_eq!(requests[0].uploads[0].key, "img_v2_1");
    assert_eq!(requests[0].uploads[0].message_id, "m7");
    assert_eq!(requests[1].content, "q3.pdf");
    assert_eq!(requests[1].uploads[0].kind, "file");
    assert_eq!(requests[1].uploads[0].name.as_deref(), Some("q3.pdf"));
}

#[tokio::test]
async fn unsupported_message_types_are_ignored_after_dedup() {
    let h = harness();
    let now = now_secs();

    let admission = h
        .ctx
        .router
        .handle_platform_event_at(push("m9", now * 1000, "sticker", json!({"file_key": "s"})), now)
        .await;

    assert_eq!(admission, Admission::Admitted);
    assert!(h.platform.reactions().is_empty());
    assert!(h.worker.requests().is_empty());
}

#[tokio::test]
async fn non_final_and_foreign_frames_send_nothing() {
    let h = harness();
    let router = &h.ctx.router;

    assert_eq!(router.dispatch_worker_value(&json!([1, 2])).await, None);
    assert_eq!(
        router
            .dispatch_worker_value(&json!({
                "method": "message",
                "action": "respond",
                "detail": {"actions": [{"type": "stream", "content": "partial"}]}
            }))
            .await,
        Some(WorkerRoute::Respond)
    );
    assert_eq!(
        router
            .dispatch_worker_value(&json!({"method": "presence", "action": "respond"}))
            .await,
        Some(WorkerRoute::Ignored)
    );
    assert_eq!(
        router
            .dispatch_worker_value(&json!({"method": "system", "action": "welcome", "detail": "hi"}))
            .await,
        Some(WorkerRoute::Welcome)
    );
    assert!(h.platform.texts().is_empty());
}
