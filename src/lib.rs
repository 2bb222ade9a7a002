pub mod config;
pub mod connection;
pub mod context;
pub mod dedup;
pub mod error;
pub mod events;
pub mod intent;
pub mod platform;
pub mod reply;
pub mod router;
pub mod tasks;
pub mod types;
pub mod webhook;
