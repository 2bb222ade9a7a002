//! Persistent duplex connection to the worker socket.
//!
//! One background task owns the socket. Callers talk to it through a command
//! channel, so sends from any task are serialized onto the single writer.
//! Parsed inbound frames are pushed into a bounded channel consumed by the
//! router; the read loop never awaits the router.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::tungstenite::{protocol::WebSocketConfig, Message};

use crate::events::{EventEmitter, LinkStatus, RelayEvent};

pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDENTITY: &str = "hi, i am feishu-relay";

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub reconnect: bool,
    /// Zero disables keepalive pings.
    pub heartbeat_interval: Duration,
    /// Zero disables the pong deadline.
    pub heartbeat_timeout: Duration,
    /// `detail` of the hello envelope sent on every open.
    pub identity: String,
    pub send_timeout: Duration,
    pub stop_timeout: Duration,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            identity: DEFAULT_IDENTITY.to_string(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }
}

/// Reconnect delay: starts at 1s, doubles per failure, capped at 30s.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: BACKOFF_FLOOR,
        }
    }
}

impl Backoff {
    /// Delay to sleep now; advances the schedule for the next failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(BACKOFF_CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_FLOOR;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

enum WsCommand {
    Send {
        text: String,
        reply: oneshot::Sender<bool>,
    },
}

struct Running {
    task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    command_tx: mpsc::Sender<WsCommand>,
}

pub struct ConnectionManager {
    options: ConnectionOptions,
    inbound_tx: mpsc::Sender<Value>,
    events: EventEmitter,
    state: Arc<Mutex<ConnectionState>>,
    dropped: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        options: ConnectionOptions,
        inbound_tx: mpsc::Sender<Value>,
        events: EventEmitter,
    ) -> Self {
        Self {
            options,
            inbound_tx,
            events,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            dropped: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn url(&self) -> &str {
        &self.options.url
    }

    /// Last state published by the loop. A loop that is no longer running
    /// always reads as disconnected.
    pub fn state(&self) -> ConnectionState {
        let state = *self.state.lock();
        if state != ConnectionState::Disconnected && !self.is_running() {
            return ConnectionState::Disconnected;
        }
        state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Worker frames dropped because the router backlog was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Spawn the connection loop. A second call while it runs is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|current| !current.task.is_finished())
        {
            tracing::info!(target = "feishu_relay::ws", url = %self.options.url, "already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let worker = ConnectionLoop {
            options: self.options.clone(),
            inbound_tx: self.inbound_tx.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            dropped: self.dropped.clone(),
            command_rx,
            stop_rx,
        };
        let task = tokio::spawn(worker.run());
        *running = Some(Running {
            task,
            stop_tx,
            command_tx,
        });
    }

    /// Stop the loop and close the socket. Waits up to the stop timeout for a
    /// clean close before aborting the task. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let Running {
            mut task,
            stop_tx,
            command_tx,
        } = running;
        let _ = stop_tx.send(true);
        drop(command_tx);

        match tokio::time::timeout(self.options.stop_timeout, &mut task).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(target = "feishu_relay::ws", "connection loop did not exit in time; aborting");
                task.abort();
            }
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }

    /// Send one text frame. Returns `false` when disconnected, on write error,
    /// or when the round-trip exceeds the send timeout.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        let command_tx = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.command_tx.clone());
        let Some(command_tx) = command_tx.filter(|_| self.is_connected()) else {
            tracing::warn!(target = "feishu_relay::ws", "send_text: not connected");
            return false;
        };

        let _guard = self.send_lock.lock().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = WsCommand::Send {
            text: text.into(),
            reply: reply_tx,
        };
        let round_trip = async {
            command_tx.send(command).await.ok()?;
            reply_rx.await.ok()
        };
        match tokio::time::timeout(self.options.send_timeout, round_trip).await {
            Ok(Some(sent)) => sent,
            Ok(None) => false,
            Err(_) => {
                tracing::warn!(target = "feishu_relay::ws", "send_text: timed out");
                false
            }
        }
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(text).await,
            Err(error) => {
                tracing::warn!(target = "feishu_relay::ws", error = %error, "send_json: encode error");
                false
            }
        }
    }
}

enum Exit {
    Stopped,
    Dropped,
}

struct ConnectionLoop {
    options: ConnectionOptions,
    inbound_tx: mpsc::Sender<Value>,
    events: EventEmitter,
    state: Arc<Mutex<ConnectionState>>,
    dropped: Arc<AtomicU64>,
    command_rx: mpsc::Receiver<WsCommand>,
    stop_rx: watch::Receiver<bool>,
}

impl ConnectionLoop {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn run(mut self) {
        let mut backoff = Backoff::default();
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_BYTES);
        ws_config.max_frame_size = Some(MAX_FRAME_BYTES);

        loop {
            if self.stop_requested() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let connect = tokio_tungstenite::connect_async_with_config(
                self.options.url.as_str(),
                Some(ws_config),
                false,
            );
            let attempt = tokio::select! {
                result = connect => Some(result),
                _ = self.stop_rx.changed() => None,
            };
            let Some(attempt) = attempt else {
                break;
            };

            let mut exit = Exit::Dropped;
            match attempt {
                Ok((ws, _)) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(target = "feishu_relay::ws", url = %self.options.url, "connected");
                    self.events.emit(RelayEvent::Connection {
                        status: LinkStatus::Connected,
                    });
                    exit = self.serve(ws).await;
                }
                Err(error) => {
                    tracing::warn!(
                        target = "feishu_relay::ws",
                        url = %self.options.url,
                        error = %error,
                        "ws connect failed"
                    );
                }
            }

            self.set_state(ConnectionState::Disconnected);
            tracing::info!(target = "feishu_relay::ws", "disconnected");
            self.events.emit(RelayEvent::Connection {
                status: LinkStatus::Disconnected,
            });

            if matches!(exit, Exit::Stopped) || !self.options.reconnect || self.stop_requested() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::debug!(
                target = "feishu_relay::ws",
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            if let Exit::Stopped = self.wait_backoff(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.command_rx.close();
        while let Ok(WsCommand::Send { reply, .. }) = self.command_rx.try_recv() {
            let _ = reply.send(false);
        }
    }

    async fn serve<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> Exit
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        let hello = json!({
            "method": "system",
            "action": "hello",
            "detail": self.options.identity,
        });
        if let Err(error) = write.send(Message::Text(hello.to_string())).await {
            tracing::warn!(target = "feishu_relay::ws", error = %error, "hello send failed");
            return Exit::Dropped;
        }

        let mut heartbeat = keepalive(self.options.heartbeat_interval);
        let mut ping_sent: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.stop_rx.changed() => {
                    self.set_state(ConnectionState::Closing);
                    let _ = tokio::time::timeout(self.options.stop_timeout, write.close()).await;
                    return Exit::Stopped;
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Send { text, reply }) => {
                            if reply.is_closed() {
                                continue;
                            }
                            match write.send(Message::Text(text)).await {
                                Ok(()) => {
                                    let _ = reply.send(true);
                                }
                                Err(error) => {
                                    tracing::warn!(target = "feishu_relay::ws", error = %error, "ws write error");
                                    let _ = reply.send(false);
                                    return Exit::Dropped;
                                }
                            }
                        }
                        None => {
                            let _ = write.close().await;
                            return Exit::Stopped;
                        }
                    }
                }
                _ = next_tick(heartbeat.as_mut()) => {
                    if ping_sent.is_none() {
                        if let Err(error) = write.send(Message::Ping(Vec::new())).await {
                            tracing::warn!(target = "feishu_relay::ws", error = %error, "keepalive ping failed");
                            return Exit::Dropped;
                        }
                        ping_sent = Some(Instant::now());
                    }
                }
                _ = pong_deadline(ping_sent, self.options.heartbeat_timeout) => {
                    tracing::warn!(
                        target = "feishu_relay::ws",
                        timeout_ms = self.options.heartbeat_timeout.as_millis() as u64,
                        "keepalive pong not received"
                    );
                    return Exit::Dropped;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.deliver(&text),
                        Some(Ok(Message::Pong(_))) => ping_sent = None,
                        Some(Ok(Message::Binary(_))) => {
                            tracing::debug!(target = "feishu_relay::ws", "ignoring binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                        Some(Err(error)) => {
                            tracing::warn!(target = "feishu_relay::ws", error = %error, "ws read error");
                            return Exit::Dropped;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(target = "feishu_relay::ws", raw = %text, "ignoring non-json text frame");
                return;
            }
        };
        match self.inbound_tx.try_send(value) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped_total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let capacity = self.inbound_tx.max_capacity();
                tracing::warn!(
                    target = "feishu_relay::ws",
                    dropped_total,
                    capacity,
                    "router backlog full; dropping frame"
                );
                self.events.emit(RelayEvent::Backpressure {
                    dropped_total,
                    capacity,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(target = "feishu_relay::ws", "router gone; dropping frame");
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Exit::Dropped,
                _ = self.stop_rx.changed() => return Exit::Stopped,
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Send { reply, .. }) => {
                            let _ = reply.send(false);
                        }
                        None => return Exit::Stopped,
                    }
                }
            }
        }
    }
}

/// Ping schedule; `None` when keepalive is disabled.
fn keepalive(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        tracing::debug!(target = "feishu_relay::ws", "keepalive disabled");
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn pong_deadline(ping_sent: Option<Instant>, timeout: Duration) {
    match ping_sent {
        Some(sent) if !timeout.is_zero() => tokio::time::sleep_until(sent + timeout).await,
        _ => std::future::pending().await,
    }
}

/// Socket url for a worker host: `ws://<host>/socket`.
///
/// Accepts a bare `host[:port]`, an `http(s)://` base, or a full `ws(s)://` url
/// (kept as given when it already has a path).
pub fn worker_socket_url(host: &str) -> Result<String> {
    let raw = host.trim().trim_end_matches('/');
    let normalized = if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{raw}")
    };

    let mut url = Url::parse(&normalized)?;
    if url.path().trim_end_matches('/').is_empty() {
        url.set_path("/socket");
    }
    Ok(url.to_string())
}

/// HTTP base for a worker host: `http://<host>`.
pub fn worker_http_base(host: &str) -> Result<String> {
    let raw = host.trim().trim_end_matches('/');
    let normalized = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = raw.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        format!("http://{raw}")
    };

    let mut url = Url::parse(&normalized)?;
    url.set_path("");
    url.set_query(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}
