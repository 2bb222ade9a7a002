use std::{
    io::{self, Write},
    sync::Arc,
};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_ansi(!cfg.json_output)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Duplicate,
    Expired,
}

/// Lifecycle events of the relay, one JSON line each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayEvent {
    Started { listen: String },
    Stopped,
    Connection { status: LinkStatus },
    /// A platform push filtered before any handler ran.
    Dedup {
        message_id: String,
        reason: DropReason,
    },
    Reply { taskid: String, receive_id: String },
    /// A worker frame dropped because the router backlog was full.
    Backpressure { dropped_total: u64, capacity: usize },
}

impl RelayEvent {
    /// `{"ts", "type", "payload"}` line for this event.
    pub fn to_line(&self) -> Value {
        let mut line = match serde_json::to_value(self) {
            Ok(line) => line,
            Err(error) => json!({ "type": "encode_error", "payload": error.to_string() }),
        };
        if let Value::Object(map) = &mut line {
            map.insert("ts".into(), json!(Utc::now().to_rfc3339()));
        }
        line
    }
}

/// Machine-readable lifecycle lines on stderr, enabled by `--json-output`.
#[derive(Clone, Debug, Default)]
pub struct EventEmitter {
    json_output: bool,
    captured: Option<Arc<Mutex<Vec<RelayEvent>>>>,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self {
            json_output,
            captured: None,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Keeps every emitted event in memory instead of writing it.
    pub fn capturing() -> Self {
        Self {
            json_output: false,
            captured: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn captured(&self) -> Vec<RelayEvent> {
        self.captured
            .as_ref()
            .map(|events| events.lock().clone())
            .unwrap_or_default()
    }

    pub fn emit(&self, event: RelayEvent) {
        if !self.json_output {
            if let Some(captured) = &self.captured {
                captured.lock().push(event);
            }
            return;
        }

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", event.to_line());
    }
}
