use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    config::{Config, ForwardVia},
    connection::{ConnectionManager, ConnectionOptions},
    dedup::{FilterSettings, SharedFilter},
    events::EventEmitter,
    intent::{IntentApi, SocketForwarder, WorkerHttpClient},
    platform::{FeishuClient, PlatformApi},
    reply::{ReplyOrchestrator, ReplySettings},
    router::Router,
    tasks::TaskDirectory,
};

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub connection: ConnectionOptions,
    pub filter: FilterSettings,
    pub reply: ReplySettings,
    pub inbound_capacity: usize,
    pub json_output: bool,
}

/// Every long-lived handle of the relay, built once at startup and passed
/// to whoever needs it.
#[derive(Clone)]
pub struct RelayContext {
    pub connection: Arc<ConnectionManager>,
    pub filter: SharedFilter,
    pub tasks: TaskDirectory,
    pub orchestrator: Arc<ReplyOrchestrator>,
    pub router: Arc<Router>,
    pub events: EventEmitter,
}

impl RelayContext {
    /// Wire the relay from config with the live platform and worker clients.
    /// The returned receiver is the router's inbound channel.
    pub fn from_config(cfg: &Config) -> Result<(Self, mpsc::Receiver<Value>)> {
        let settings = ContextSettings {
            connection: cfg.connection_options()?,
            filter: cfg.filter_settings(),
            reply: cfg.reply_settings(),
            inbound_capacity: cfg.inbound_capacity,
            json_output: cfg.json_output,
        };
        let platform: Arc<dyn PlatformApi> = Arc::new(FeishuClient::new(
            cfg.feishu_base_url.clone(),
            cfg.feishu_app_id.clone(),
            cfg.feishu_app_secret.clone(),
        ));

        let forward_via = cfg.forward_via;
        let http_base = cfg.worker_http_base()?;
        let timeout = cfg.intent_timeout();
        Ok(Self::assemble(settings, platform, move |connection| {
            let intent: Arc<dyn IntentApi> = match forward_via {
                ForwardVia::Http => Arc::new(WorkerHttpClient::new(http_base, timeout)),
                ForwardVia::Socket => Arc::new(SocketForwarder::new(Arc::clone(connection))),
            };
            intent
        }))
    }

    /// Wire the relay around the given collaborators. `intent` receives the
    /// connection manager so a forwarder can share the worker socket.
    pub fn assemble<F>(
        settings: ContextSettings,
        platform: Arc<dyn PlatformApi>,
        intent: F,
    ) -> (Self, mpsc::Receiver<Value>)
    where
        F: FnOnce(&Arc<ConnectionManager>) -> Arc<dyn IntentApi>,
    {
        let events = EventEmitter::new(settings.json_output);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));
        let connection = Arc::new(ConnectionManager::new(
            settings.connection,
            inbound_tx,
            events.clone(),
        ));
        let intent = intent(&connection);

        let filter = SharedFilter::new(settings.filter);
        let tasks = TaskDirectory::new(settings.filter.ttl_secs);
        let orchestrator = Arc::new(ReplyOrchestrator::new(
            platform,
            intent,
            tasks.clone(),
            settings.reply,
            events.clone(),
        ));
        let router = Arc::new(Router::new(
            filter.clone(),
            Arc::clone(&orchestrator),
            events.clone(),
        ));

        (
            Self {
                connection,
                filter,
                tasks,
                orchestrator,
                router,
                events,
            },
            inbound_rx,
        )
    }
}
