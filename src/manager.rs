//! The WebSocket connection manager.
//!
//! One [`WebSocketManager`] owns one logical connection identity: it
//! establishes the socket, runs the receive loop, polls the proactive
//! controller, applies the reconnect policy on failure, and publishes state
//! and statistics. All mutable state (connection state, statistics, attempt
//! counter) is funneled through a single spawned run-loop task that owns the
//! socket handle and consumes commands over a channel, so no partial state
//! transition is ever observable.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control::{
    DisconnectHook, DisconnectPredicate, ProactiveController, ReconnectPredicate,
};
use crate::error::{ConnectionFailed, ReconnectExhausted};
use crate::policy::ReconnectPolicy;
use crate::queue::MessageQueue;
use crate::state::{ConnectionState, DisconnectReason};
use crate::stats::{StatsRecorder, WsStats};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An application-level message carried over the connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Payload size in bytes, as counted by the traffic statistics.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(data) => Message::Binary(data.into()),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

/// Construction parameters for a [`WebSocketManager`].
///
/// ```ignore
/// let options = ManagerOptions::builder()
///     .url("wss://example.com/stream")
///     .config(config)
///     .build();
/// let manager = WebSocketManager::new(options)?;
/// ```
#[derive(Builder)]
#[non_exhaustive]
pub struct ManagerOptions {
    /// Target endpoint; must use the `ws` or `wss` scheme
    #[builder(into)]
    pub url: String,
    /// Behavior configuration
    #[builder(default)]
    pub config: Config,
    /// Polled while connected; `true` triggers a proactive disconnect
    pub should_disconnect: Option<Arc<dyn DisconnectPredicate>>,
    /// Polled while waiting to reconnect; gates callback-controlled retries
    pub should_reconnect: Option<Arc<dyn ReconnectPredicate>>,
    /// Invoked once per disconnect; failures are logged and swallowed
    pub on_disconnect: Option<Arc<dyn DisconnectHook>>,
}

/// Consumer handle over the inbound message queue.
///
/// The handle survives reconnects: the queue is independent of any single
/// socket, so the same consumer keeps receiving after an automatic
/// reconnect without re-subscribing.
#[derive(Debug, Clone)]
pub struct Messages {
    queue: Arc<MessageQueue<Payload>>,
}

impl Messages {
    /// Receive the next message, waiting until one arrives.
    ///
    /// Returns `None` once the manager is closed and the queue is drained.
    pub async fn recv(&self) -> Option<Payload> {
        self.queue.pop().await
    }

    /// Receive without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Payload> {
        self.queue.try_pop()
    }

    /// Turn this handle into a lazy stream of messages.
    pub fn into_stream(self) -> impl futures::Stream<Item = Payload> {
        async_stream::stream! {
            while let Some(payload) = self.queue.pop().await {
                yield payload;
            }
        }
    }
}

enum Command {
    Connect {
        ack: oneshot::Sender<Result<()>>,
    },
    Send {
        payload: Payload,
        ack: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reason: DisconnectReason,
        reconnect_after: Option<Duration>,
        ack: oneshot::Sender<()>,
    },
    ScheduleReconnect {
        delay: Duration,
        ack: oneshot::Sender<()>,
    },
    AdvertiseLimit {
        limit: Duration,
    },
}

/// Manages one persistent WebSocket connection: lifecycle, reconnection,
/// proactive teardown, and traffic accounting.
///
/// Cloning the manager clones a handle to the same connection. The manager
/// reaches [`ConnectionState::Closed`] at most once and must not be reused
/// afterwards; construct a new instance for a new connection identity.
///
/// # Example
///
/// ```ignore
/// let manager = WebSocketManager::new(
///     ManagerOptions::builder().url("wss://example.com/ws").build(),
/// )?;
///
/// manager.connect().await?;
/// manager.send("hello").await?;
///
/// let messages = manager.messages();
/// while let Some(msg) = messages.recv().await {
///     println!("received: {msg:?}");
/// }
/// ```
#[derive(Clone)]
pub struct WebSocketManager {
    url: String,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    stats: Arc<StatsRecorder>,
    queue: Arc<MessageQueue<Payload>>,
    controller: Arc<ProactiveController>,
}

impl WebSocketManager {
    /// Create a manager and spawn its run loop. Does not connect yet.
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let parsed = url::Url::parse(&options.url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported scheme {:?}, expected ws or wss",
                parsed.scheme()
            )));
        }

        let config = options.config;
        let cancel = CancellationToken::new();
        let stats = Arc::new(StatsRecorder::new());
        let queue = Arc::new(MessageQueue::new(config.queue_capacity, config.overflow));
        let controller = Arc::new(ProactiveController::new(
            config.disconnect_check_interval,
            config.reconnect_check_interval,
            options.should_disconnect,
            options.should_reconnect,
            cancel.clone(),
        ));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            url: options.url.clone(),
            policy: ReconnectPolicy::new(config.strategy, config.reconnect.clone()),
            connection_limit: config.connection_limit,
            config,
            state_tx,
            stats: Arc::clone(&stats),
            queue: Arc::clone(&queue),
            controller: Arc::clone(&controller),
            hook: options.on_disconnect,
            command_rx,
            cancel,
            pending_delay: None,
            connect_acks: Vec::new(),
            schedule_acks: Vec::new(),
            last_error: None,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            url: options.url,
            command_tx,
            state_rx,
            stats,
            queue,
            controller,
        })
    }

    /// Target endpoint this manager connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Establish the connection, suspending until connected or permanently
    /// failed.
    ///
    /// With `auto_reconnect` enabled, transport failures are retried per the
    /// reconnect strategy and this only returns an error once retries are
    /// exhausted; with it disabled, the first failure surfaces
    /// [`ConnectionFailed`] and the manager reaches
    /// [`ConnectionState::Closed`]. Connecting is rejected with an invalid
    /// state error unless the manager is disconnected or reconnecting.
    pub async fn connect(&self) -> Result<()> {
        let (ack, response) = oneshot::channel();
        self.command_tx
            .send(Command::Connect { ack })
            .map_err(|_| Error::closed())?;
        response.await.map_err(|_| Error::closed())?
    }

    /// Send a message over the live connection.
    ///
    /// Fails with a closed-connection error when not connected; a transport
    /// failure mid-send is reclassified as a reactive disconnect and also
    /// surfaces here. Sends are never retried transparently; resend after
    /// reconnection.
    pub async fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        let (ack, response) = oneshot::channel();
        self.command_tx
            .send(Command::Send {
                payload: payload.into(),
                ack,
            })
            .map_err(|_| Error::closed())?;
        response.await.map_err(|_| Error::closed())?
    }

    /// Serialize `value` as JSON and send it as a text message.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.send(json).await
    }

    /// Consumer handle over received messages. May be cloned freely and
    /// keeps working across reconnects.
    #[must_use]
    pub fn messages(&self) -> Messages {
        Messages {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Proactively close the connection, suspending until closed.
    ///
    /// No-op when already disconnected or closed. `reconnect_after`
    /// overrides the reconnect policy's delay for the next automatic
    /// reconnect cycle only.
    pub async fn request_disconnect(
        &self,
        reason: DisconnectReason,
        reconnect_after: Option<Duration>,
    ) {
        let (ack, response) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Disconnect {
                reason,
                reconnect_after,
                ack,
            })
            .is_err()
        {
            // Run loop already gone: nothing to close.
            return;
        }
        _ = response.await;
    }

    /// [`request_disconnect`](Self::request_disconnect) with
    /// [`DisconnectReason::UserRequested`] and no reconnect override.
    pub async fn disconnect(&self) {
        self.request_disconnect(DisconnectReason::UserRequested, None)
            .await;
    }

    /// Schedule a reconnect attempt after `delay`, suspending until the
    /// attempt is initiated. No-op while connected: a stale reconnect must
    /// not tear down a connection that was just re-established.
    pub async fn schedule_reconnect(&self, delay: Duration) {
        let (ack, response) = oneshot::channel();
        if self
            .command_tx
            .send(Command::ScheduleReconnect { delay, ack })
            .is_err()
        {
            return;
        }
        _ = response.await;
    }

    /// Feed a server-advertised maximum connection lifetime to the manager.
    ///
    /// The manager proactively disconnects (reason
    /// [`DisconnectReason::ConnectionLimit`], immediate reconnect) at
    /// `limit − disconnect_margin` into the connection, so the link is
    /// re-established cleanly before the server forcibly drops it.
    pub fn advertise_connection_limit(&self, limit: Duration) {
        _ = self.command_tx.send(Command::AdvertiseLimit { limit });
    }

    /// Block until the reconnect predicate allows an attempt; see
    /// [`ProactiveController::wait_for_reconnect_window`].
    pub async fn wait_for_reconnect_window(
        &self,
        should_reconnect: Option<Arc<dyn ReconnectPredicate>>,
        timeout: Option<Duration>,
    ) -> bool {
        self.controller
            .wait_for_reconnect_window(should_reconnect, timeout)
            .await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for detecting reconnections and re-establishing
    /// application-level subscriptions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Snapshot of the connection statistics, cumulative across reconnects.
    #[must_use]
    pub fn stats(&self) -> WsStats {
        self.stats.snapshot()
    }

    /// Duration since this manager was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.stats.uptime()
    }

    /// Messages dropped by the inbound queue so far.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.queue.dropped()
    }
}

impl std::fmt::Debug for WebSocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketManager")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// How a finished connection episode ended.
struct LinkOutcome {
    reason: DisconnectReason,
    reconnect_after: Option<Duration>,
    /// All manager handles are gone or teardown was requested; do not
    /// reconnect regardless of configuration.
    shutdown: bool,
    /// Acknowledged only after the disconnect is recorded and the state has
    /// moved on, so `request_disconnect` callers observe consistent stats.
    ack: Option<oneshot::Sender<()>>,
}

impl LinkOutcome {
    fn reactive(reason: DisconnectReason) -> Self {
        Self {
            reason,
            reconnect_after: None,
            shutdown: false,
            ack: None,
        }
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum WaitAction {
    Keep,
    AttemptNow,
    Restart(Duration),
    Stop,
}

/// The run-loop task. Exclusive owner of the socket handle, the state
/// machine, and the reconnect policy.
struct Driver {
    url: String,
    config: Config,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<StatsRecorder>,
    queue: Arc<MessageQueue<Payload>>,
    controller: Arc<ProactiveController>,
    hook: Option<Arc<dyn DisconnectHook>>,
    policy: ReconnectPolicy,
    command_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    connection_limit: Option<Duration>,
    /// One-shot delay override for the next reconnect cycle
    pending_delay: Option<Duration>,
    /// Callers suspended in `connect()`
    connect_acks: Vec<oneshot::Sender<Result<()>>>,
    /// Callers suspended in `schedule_reconnect()`
    schedule_acks: Vec<oneshot::Sender<()>>,
    last_error: Option<String>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if self.state().is_terminal() {
                break;
            }

            // Idle: disconnected, waiting for instructions.
            let flow = tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_idle_command(cmd).await,
                    None => Flow::Stop,
                },
                () = self.cancel.cancelled() => Flow::Stop,
            };
            if flow == Flow::Stop {
                break;
            }
        }
        self.finish();
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%current, %next, "Ignoring illegal state transition");
            return;
        }
        _ = self.state_tx.send(next);
    }

    async fn handle_idle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect { ack } => {
                self.connect_acks.push(ack);
                self.connect_cycle(false).await
            }
            Command::Send { ack, .. } => {
                _ = ack.send(Err(Error::closed()));
                Flow::Continue
            }
            Command::Disconnect { ack, .. } => {
                // Already disconnected: idempotent no-op, nothing recorded.
                _ = ack.send(());
                Flow::Continue
            }
            Command::ScheduleReconnect { delay, ack } => {
                self.set_state(ConnectionState::Reconnecting);
                self.pending_delay = Some(delay);
                self.schedule_acks.push(ack);
                self.connect_cycle(true).await
            }
            Command::AdvertiseLimit { limit } => {
                self.connection_limit = Some(limit);
                Flow::Continue
            }
        }
    }

    /// Connect, drive the live connection, and reconnect per policy, until
    /// the manager closes. Entered from the first `connect()` or a scheduled
    /// reconnect; only exits with `Flow::Stop`.
    async fn connect_cycle(&mut self, wait_first: bool) -> Flow {
        if wait_first && self.reconnect_wait().await == Flow::Stop {
            return Flow::Stop;
        }

        loop {
            self.set_state(ConnectionState::Connecting);
            for ack in self.schedule_acks.drain(..) {
                _ = ack.send(());
            }

            match timeout(self.config.connect_timeout, connect_async(&self.url)).await {
                Ok(Ok((stream, _response))) => {
                    self.policy.record_success();
                    self.stats.record_connect();
                    self.last_error = None;
                    self.set_state(ConnectionState::Connected);
                    for ack in self.connect_acks.drain(..) {
                        _ = ack.send(Ok(()));
                    }
                    #[cfg(feature = "tracing")]
                    tracing::info!(url = %self.url, "WebSocket connected");

                    let outcome = self.drive_connection(stream).await;
                    if self.handle_disconnect(outcome).await == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Ok(Err(e)) => {
                    if self.register_connect_failure(Error::from(e)) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Err(_elapsed) => {
                    let err = Error::timeout("connect", self.config.connect_timeout);
                    if self.register_connect_failure(err) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
            }

            if self.reconnect_wait().await == Flow::Stop {
                return Flow::Stop;
            }
        }
    }

    fn register_connect_failure(&mut self, err: Error) -> Flow {
        let attempts = self.policy.record_failure();
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %self.url, attempts, %err, "Unable to connect");
        self.last_error = Some(err.to_string());

        if !self.config.auto_reconnect {
            let url = self.url.clone();
            let last_error = self.last_error.clone();
            for ack in self.connect_acks.drain(..) {
                _ = ack.send(Err(ConnectionFailed {
                    url: url.clone(),
                    attempts,
                    last_error: last_error.clone(),
                }
                .into()));
            }
            self.close_terminally();
            return Flow::Stop;
        }

        if self.policy.exhausted() {
            for ack in self.connect_acks.drain(..) {
                _ = ack.send(Err(ReconnectExhausted {
                    attempts,
                    last_error: self.last_error.clone(),
                }
                .into()));
            }
            self.close_terminally();
            return Flow::Stop;
        }

        self.set_state(ConnectionState::Reconnecting);
        Flow::Continue
    }

    /// Drive one live connection until it ends, handling socket I/O,
    /// commands, the disconnect predicate timer, heartbeats, and the
    /// connection-lifetime deadline in a single select loop.
    async fn drive_connection(&mut self, stream: WsStream) -> LinkOutcome {
        let (mut write, mut read) = stream.split();
        let connected_at = Instant::now();
        let mut limit_deadline = self.limit_deadline(connected_at);

        let mut disconnect_check = interval_at(
            connected_at + self.config.disconnect_check_interval,
            self.config.disconnect_check_interval,
        );
        disconnect_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval_at(
            connected_at + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut awaiting_pong: Option<Instant> = None;

        let controller = Arc::clone(&self.controller);
        let cancel = self.cancel.clone();

        loop {
            let deadline = limit_deadline;
            let limit_wait = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let bytes = text.len() as u64;
                        self.deliver(Payload::Text(text.as_str().to_owned()), bytes);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let bytes = data.len() as u64;
                        self.deliver(Payload::Binary(data.to_vec()), bytes);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = None;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The transport replies with a pong on the next flush.
                    }
                    Some(Ok(Message::Close(_frame))) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(url = %self.url, "Server closed the connection");
                        return LinkOutcome::reactive(DisconnectReason::ServerClosed);
                    }
                    Some(Ok(_)) => {
                        // Raw frames are not surfaced by the transport here.
                    }
                    Some(Err(e)) => {
                        let reason = classify_read_error(&e);
                        #[cfg(feature = "tracing")]
                        tracing::warn!(url = %self.url, error = %e, %reason, "Receive loop terminated");
                        self.last_error = Some(e.to_string());
                        return LinkOutcome::reactive(reason);
                    }
                    None => {
                        return LinkOutcome::reactive(DisconnectReason::ServerClosed);
                    }
                },

                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Connect { ack }) => {
                        _ = ack.send(Err(Error::invalid_state(
                            ConnectionState::Connected,
                            "connect",
                        )));
                    }
                    Some(Command::Send { payload, ack }) => {
                        let bytes = payload.len() as u64;
                        match write.send(payload.into_message()).await {
                            Ok(()) => {
                                self.stats.record_sent(bytes);
                                _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                _ = ack.send(Err(Error::from(e)));
                                return LinkOutcome::reactive(DisconnectReason::NetworkError);
                            }
                        }
                    }
                    Some(Command::Disconnect { reason, reconnect_after, ack }) => {
                        self.set_state(ConnectionState::Closing);
                        _ = write.send(Message::Close(None)).await;
                        return LinkOutcome {
                            reason,
                            reconnect_after,
                            shutdown: false,
                            ack: Some(ack),
                        };
                    }
                    Some(Command::ScheduleReconnect { ack, .. }) => {
                        // A fresh connection beat the stale reconnect request.
                        _ = ack.send(());
                    }
                    Some(Command::AdvertiseLimit { limit }) => {
                        self.connection_limit = Some(limit);
                        limit_deadline = self.limit_deadline(connected_at);
                    }
                    None => {
                        _ = write.send(Message::Close(None)).await;
                        return LinkOutcome {
                            reason: DisconnectReason::UserRequested,
                            reconnect_after: None,
                            shutdown: true,
                            ack: None,
                        };
                    }
                },

                _ = disconnect_check.tick() => {
                    if controller.poll_disconnect().await {
                        self.set_state(ConnectionState::Closing);
                        _ = write.send(Message::Close(None)).await;
                        return LinkOutcome {
                            reason: DisconnectReason::CallbackTriggered,
                            reconnect_after: None,
                            shutdown: false,
                            ack: None,
                        };
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() >= self.config.heartbeat_timeout {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                url = %self.url,
                                timeout = ?self.config.heartbeat_timeout,
                                "No pong within heartbeat timeout"
                            );
                            return LinkOutcome::reactive(DisconnectReason::PingTimeout);
                        }
                    } else if write.send(Message::Ping(Bytes::new())).await.is_ok() {
                        awaiting_pong = Some(Instant::now());
                    } else {
                        return LinkOutcome::reactive(DisconnectReason::NetworkError);
                    }
                }

                () = limit_wait => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        url = %self.url,
                        margin = ?self.config.disconnect_margin,
                        "Connection lifetime limit approaching, reconnecting early"
                    );
                    self.set_state(ConnectionState::Closing);
                    _ = write.send(Message::Close(None)).await;
                    return LinkOutcome {
                        reason: DisconnectReason::ConnectionLimit,
                        reconnect_after: Some(Duration::ZERO),
                        shutdown: false,
                        ack: None,
                    };
                }

                () = cancel.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    return LinkOutcome {
                        reason: DisconnectReason::UserRequested,
                        reconnect_after: None,
                        shutdown: true,
                        ack: None,
                    };
                }
            }
        }
    }

    /// Central disconnect funnel: records exactly one disconnect per
    /// physical connection loss, invokes the hook, then either closes or
    /// schedules the reconnect.
    async fn handle_disconnect(&mut self, outcome: LinkOutcome) -> Flow {
        self.stats.record_disconnect(outcome.reason.is_proactive());
        #[cfg(feature = "tracing")]
        tracing::info!(
            url = %self.url,
            reason = %outcome.reason,
            proactive = outcome.reason.is_proactive(),
            "Disconnected"
        );

        if let Some(hook) = self.hook.clone() {
            if let Err(e) = hook.on_disconnect(outcome.reason).await {
                // Hook failures never block the state transition.
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "on_disconnect hook failed");
                #[cfg(not(feature = "tracing"))]
                let _: &Error = &e;
            }
        }

        let flow = if outcome.shutdown || !self.config.auto_reconnect || outcome.reason.is_terminal()
        {
            self.close_terminally();
            Flow::Stop
        } else {
            self.set_state(ConnectionState::Reconnecting);
            self.pending_delay = outcome.reconnect_after;
            Flow::Continue
        };

        if let Some(ack) = outcome.ack {
            _ = ack.send(());
        }
        flow
    }

    /// Wait out the delay before the next reconnect attempt, servicing
    /// commands meanwhile. A pending `reconnect_after` override bypasses the
    /// policy for this one cycle.
    async fn reconnect_wait(&mut self) -> Flow {
        let delay = self.pending_delay.take().or_else(|| self.policy.next_delay());
        match delay {
            Some(delay) => self.timed_wait(delay).await,
            None => self.gated_wait().await,
        }
    }

    async fn timed_wait(&mut self, delay: Duration) -> Flow {
        let mut wake_at = Instant::now() + delay;
        loop {
            tokio::select! {
                () = sleep_until(wake_at) => return Flow::Continue,
                cmd = self.command_rx.recv() => match self.handle_wait_command(cmd) {
                    WaitAction::Keep => {}
                    WaitAction::AttemptNow => return Flow::Continue,
                    WaitAction::Restart(new_delay) => wake_at = Instant::now() + new_delay,
                    WaitAction::Stop => return Flow::Stop,
                },
                () = self.cancel.cancelled() => {
                    self.close_terminally();
                    return Flow::Stop;
                }
            }
        }
    }

    /// Callback-controlled waiting: the reconnect predicate alone decides
    /// when to attempt; the manager never self-terminates retries here.
    async fn gated_wait(&mut self) -> Flow {
        let controller = Arc::clone(&self.controller);
        loop {
            tokio::select! {
                proceed = controller.reconnect_gate() => {
                    if proceed {
                        return Flow::Continue;
                    }
                }
                cmd = self.command_rx.recv() => match self.handle_wait_command(cmd) {
                    WaitAction::Keep => {}
                    WaitAction::AttemptNow => return Flow::Continue,
                    WaitAction::Restart(new_delay) => return self.timed_wait(new_delay).await,
                    WaitAction::Stop => return Flow::Stop,
                },
                () = self.cancel.cancelled() => {
                    self.close_terminally();
                    return Flow::Stop;
                }
            }
        }
    }

    fn handle_wait_command(&mut self, cmd: Option<Command>) -> WaitAction {
        match cmd {
            Some(Command::Connect { ack }) => {
                // can_connect() holds while reconnecting: attempt right away.
                self.connect_acks.push(ack);
                WaitAction::AttemptNow
            }
            Some(Command::Send { ack, .. }) => {
                _ = ack.send(Err(Error::closed()));
                WaitAction::Keep
            }
            Some(Command::Disconnect { reconnect_after, ack, .. }) => {
                // No live connection to lose, so nothing is recorded; the
                // pending reconnect is cancelled (or rescheduled).
                if let Some(delay) = reconnect_after {
                    _ = ack.send(());
                    WaitAction::Restart(delay)
                } else {
                    self.set_state(ConnectionState::Closing);
                    self.close_terminally();
                    _ = ack.send(());
                    WaitAction::Stop
                }
            }
            Some(Command::ScheduleReconnect { delay, ack }) => {
                self.schedule_acks.push(ack);
                WaitAction::Restart(delay)
            }
            Some(Command::AdvertiseLimit { limit }) => {
                self.connection_limit = Some(limit);
                WaitAction::Keep
            }
            None => {
                self.close_terminally();
                WaitAction::Stop
            }
        }
    }

    fn deliver(&self, payload: Payload, bytes: u64) {
        match self.queue.push(payload) {
            Ok(()) => self.stats.record_received(bytes),
            Err(e) => {
                // The socket read still happened: bytes count, the message
                // does not.
                self.stats.record_rejected_frame(bytes);
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Inbound message rejected by full queue");
                #[cfg(not(feature = "tracing"))]
                let _: &Error = &e;
            }
        }
    }

    fn limit_deadline(&self, connected_at: Instant) -> Option<Instant> {
        self.connection_limit
            .map(|limit| connected_at + limit.saturating_sub(self.config.disconnect_margin))
    }

    fn close_terminally(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.queue.close();
        self.cancel.cancel();
    }

    fn finish(&mut self) {
        for ack in self.connect_acks.drain(..) {
            _ = ack.send(Err(Error::closed()));
        }
        for ack in self.schedule_acks.drain(..) {
            _ = ack.send(());
        }
        if !self.state().is_terminal() {
            self.set_state(ConnectionState::Closed);
        }
        self.queue.close();
        self.cancel.cancel();
    }
}

fn classify_read_error(e: &tokio_tungstenite::tungstenite::Error) -> DisconnectReason {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match e {
        WsError::Protocol(_) | WsError::Capacity(_) => DisconnectReason::ProtocolError,
        WsError::ConnectionClosed | WsError::AlreadyClosed => DisconnectReason::ServerClosed,
        _ => DisconnectReason::NetworkError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_length_counts_bytes() {
        assert_eq!(Payload::from("héllo").len(), 6);
        assert_eq!(Payload::from(vec![1_u8, 2, 3]).len(), 3);
        assert!(Payload::from(String::new()).is_empty());
    }

    #[test]
    fn payload_text_accessor() {
        assert_eq!(Payload::from("hi").as_text(), Some("hi"));
        assert_eq!(Payload::from(vec![0_u8]).as_text(), None);
    }

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let options = ManagerOptions::builder()
            .url("https://example.com/ws")
            .build();

        let err = WebSocketManager::new(options).expect_err("https must be rejected");
        assert_eq!(err.kind(), crate::error::Kind::Validation);
    }

    #[tokio::test]
    async fn new_manager_starts_disconnected() {
        let manager = WebSocketManager::new(
            ManagerOptions::builder().url("ws://127.0.0.1:9/ws").build(),
        )
        .expect("manager");

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.stats().connects, 0);
    }
}
