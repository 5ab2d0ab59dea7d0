use std::time::Duration;

use crate::policy::{ReconnectConfig, ReconnectStrategy};
use crate::queue::OverflowPolicy;

const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_DISCONNECT_MARGIN_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_DISCONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration for manager behavior. Immutable after construction.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Automatically reconnect after connection loss
    pub auto_reconnect: bool,
    /// How the delay between reconnect attempts is computed
    pub strategy: ReconnectStrategy,
    /// Reconnection timing configuration
    pub reconnect: ReconnectConfig,
    /// Maximum time for a single connect attempt
    pub connect_timeout: Duration,
    /// Safety buffer subtracted from a server-advertised connection lifetime
    /// before proactively disconnecting
    pub disconnect_margin: Duration,
    /// Interval for polling the `should_disconnect` predicate while connected
    pub disconnect_check_interval: Duration,
    /// Interval for polling the `should_reconnect` predicate while waiting
    pub reconnect_check_interval: Duration,
    /// Statically-known server connection lifetime limit, if any. Can also
    /// be supplied at runtime once the server advertises one.
    pub connection_limit: Option<Duration>,
    /// Interval for sending protocol-level pings to keep the connection alive
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for a pong before considering the connection dead
    pub heartbeat_timeout: Duration,
    /// Capacity of the inbound message queue
    pub queue_capacity: usize,
    /// What happens when the inbound queue is full
    pub overflow: OverflowPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            strategy: ReconnectStrategy::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            disconnect_margin: DEFAULT_DISCONNECT_MARGIN_DURATION,
            disconnect_check_interval: DEFAULT_DISCONNECT_CHECK_INTERVAL,
            reconnect_check_interval: DEFAULT_RECONNECT_CHECK_INTERVAL,
            connection_limit: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}
