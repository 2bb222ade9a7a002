use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};

use crate::{
    connection::{worker_http_base, worker_socket_url, ConnectionOptions},
    dedup::FilterSettings,
    reply::ReplySettings,
    types::{ReceiveIdType, ReceiveTarget},
};

/// How user messages reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ForwardVia {
    /// `POST /api/intent`, response interpreted inline.
    Http,
    /// `message/user-input` over the worker socket; results arrive as `respond`.
    Socket,
}

#[derive(Debug, Parser, Clone)]
#[command(name = "feishu-relay")]
#[command(about = "Relays Feishu chat messages to an agent worker and worker results back")]
pub struct Config {
    #[arg(long, env = "RELAY_WORKER_HOST", default_value = "127.0.0.1:8080")]
    pub worker_host: String,

    #[arg(
        long,
        env = "RELAY_RECONNECT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub reconnect: bool,

    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long, env = "RELAY_HEARTBEAT_TIMEOUT_SECS", default_value_t = 10)]
    pub heartbeat_timeout_secs: u64,

    #[arg(long, env = "RELAY_DEDUP_TTL_SECS", default_value_t = 1800)]
    pub dedup_ttl_secs: i64,

    #[arg(long, env = "RELAY_STALENESS_SECS", default_value_t = 600)]
    pub staleness_secs: i64,

    #[arg(long, env = "RELAY_DEDUP_MAX_ENTRIES", default_value_t = 8192)]
    pub dedup_max_entries: usize,

    #[arg(long, env = "RELAY_DEDUP_SWEEP_SECS", default_value_t = 60)]
    pub dedup_sweep_secs: u64,

    #[arg(long, env = "RELAY_IDENTITY", default_value = "hi, i am feishu-relay")]
    pub identity: String,

    #[arg(long, env = "RELAY_SESSION", default_value = "feishu-bot")]
    pub session: String,

    #[arg(long, env = "RELAY_INTENT_TIMEOUT_SECS", default_value_t = 90)]
    pub intent_timeout_secs: u64,

    #[arg(long, env = "RELAY_INBOUND_CAPACITY", default_value_t = 256)]
    pub inbound_capacity: usize,

    #[arg(long, env = "RELAY_FORWARD_VIA", value_enum, default_value_t = ForwardVia::Http)]
    pub forward_via: ForwardVia,

    #[arg(long, env = "FEISHU_APP_ID")]
    pub feishu_app_id: String,

    #[arg(long, env = "FEISHU_APP_SECRET", hide_env_values = true)]
    pub feishu_app_secret: String,

    #[arg(long, env = "FEISHU_BASE_URL", default_value = "https://open.feishu.cn")]
    pub feishu_base_url: String,

    #[arg(long, env = "FEISHU_VERIFICATION_TOKEN", hide_env_values = true)]
    pub feishu_verification_token: Option<String>,

    #[arg(long, env = "FEISHU_REPLY_RECEIVE_ID")]
    pub reply_receive_id: Option<String>,

    #[arg(long, env = "FEISHU_REPLY_RECEIVE_ID_TYPE", default_value = "email")]
    pub reply_receive_id_type: ReceiveIdType,

    #[arg(long, env = "FEISHU_ACK_EMOJI", default_value = "OnIt")]
    pub ack_emoji: String,

    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:3890")]
    pub listen: SocketAddr,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "RELAY_JSON_OUTPUT", default_value_t = false)]
    pub json_output: bool,
}

impl Config {
    pub fn worker_ws_url(&self) -> Result<String> {
        worker_socket_url(&self.worker_host)
    }

    pub fn worker_http_base(&self) -> Result<String> {
        worker_http_base(&self.worker_host)
    }

    pub fn connection_options(&self) -> Result<ConnectionOptions> {
        Ok(ConnectionOptions::new(self.worker_ws_url()?)
            .with_reconnect(self.reconnect)
            .with_heartbeat(
                Duration::from_secs(self.heartbeat_secs),
                Duration::from_secs(self.heartbeat_timeout_secs),
            )
            .with_identity(self.identity.clone()))
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            ttl_secs: self.dedup_ttl_secs,
            staleness_secs: self.staleness_secs,
            max_entries: self.dedup_max_entries,
        }
    }

    pub fn intent_timeout(&self) -> Duration {
        Duration::from_secs(self.intent_timeout_secs)
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_sweep_secs.max(1))
    }

    /// Destination for worker results that carry no known task id.
    pub fn fallback_reply_target(&self) -> Option<ReceiveTarget> {
        self.reply_receive_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| ReceiveTarget::new(id, self.reply_receive_id_type))
    }

    pub fn reply_settings(&self) -> ReplySettings {
        ReplySettings {
            session: self.session.clone(),
            ack_emoji: self.ack_emoji.clone(),
            fallback: self.fallback_reply_target(),
        }
    }
}
