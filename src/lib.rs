#![cfg_attr(doc, doc = include_str!("../README.md"))]
#![expect(
    clippy::module_name_repetitions,
    reason = "Public type names stay descriptive when imported without their module path"
)]

pub mod config;
pub mod control;
pub mod error;
pub mod manager;
pub mod policy;
pub mod queue;
pub mod state;
pub mod stats;

pub use crate::config::Config;
pub use crate::control::{
    DisconnectHook, DisconnectPredicate, ProactiveController, ReconnectPredicate, ReconnectSignal,
};
pub use crate::error::Error;
pub use crate::manager::{ManagerOptions, Messages, Payload, WebSocketManager};
pub use crate::policy::{ReconnectConfig, ReconnectStrategy};
pub use crate::queue::{MessageQueue, OverflowPolicy};
pub use crate::state::{ConnectionState, DisconnectReason};
pub use crate::stats::{StatsRecorder, WsStats};

pub type Result<T> = std::result::Result<T, Error>;
