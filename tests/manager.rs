#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use sockline::{
    Config, ConnectionState, DisconnectHook, DisconnectPredicate, DisconnectReason,
    ManagerOptions, Payload, ReconnectSignal, ReconnectStrategy, WebSocketManager,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Drops every live connection without a close handshake
    kill_tx: broadcast::Sender<()>,
    /// Receives text messages sent by clients
    received_rx: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (kill_tx, _) = broadcast::channel::<()>(8);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = message_tx.clone();
        let kill = kill_tx.clone();
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let received = received_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut kill_rx = kill.subscribe();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        if write.send(Message::Pong(data)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            // Dropping the halves closes the TCP stream with
                            // no close handshake, like a dying server.
                            _ = kill_rx.recv() => break,
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            kill_tx,
            received_rx,
            connections,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Send a message to all connected clients.
    fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    /// Hard-drop every live connection.
    fn kill_connections(&self) {
        drop(self.kill_tx.send(()));
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Receive the next message a client sent.
    async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init(),
    );
}

/// Short intervals for tests; heartbeat effectively disabled so slow CI
/// machines never trip a ping timeout mid-test.
fn fast_config() -> Config {
    let mut config = Config::default();
    config.strategy = ReconnectStrategy::Immediate;
    config.connect_timeout = Duration::from_secs(2);
    config.disconnect_check_interval = Duration::from_millis(20);
    config.reconnect_check_interval = Duration::from_millis(20);
    config.heartbeat_interval = Duration::from_secs(60);
    config.heartbeat_timeout = Duration::from_secs(60);
    config.reconnect.initial_backoff = Duration::from_millis(20);
    config.reconnect.max_backoff = Duration::from_millis(100);
    config
}

fn manager_for(url: String, config: Config) -> WebSocketManager {
    WebSocketManager::new(ManagerOptions::builder().url(url).config(config).build()).unwrap()
}

async fn wait_for_state(manager: &WebSocketManager, target: ConnectionState) {
    let mut rx = manager.state_receiver();
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .expect("state channel closed");
}

async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn connect_then_disconnect_reaches_closed() {
        let server = MockWsServer::start().await;
        let mut config = fast_config();
        config.auto_reconnect = false;
        let manager = manager_for(server.ws_url(), config);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.stats().connects, 1);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);

        let stats = manager.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.proactive_disconnects, 1);
        assert_eq!(stats.reactive_disconnects, 0);

        // A closed manager rejects further traffic.
        assert!(manager.send("late").await.is_err());
        assert!(manager.connect().await.is_err());
    }

    #[tokio::test]
    async fn request_disconnect_is_idempotent() {
        let server = MockWsServer::start().await;
        let mut config = fast_config();
        config.auto_reconnect = false;
        let manager = manager_for(server.ws_url(), config);

        manager.connect().await.unwrap();
        manager
            .request_disconnect(DisconnectReason::UserRequested, None)
            .await;
        manager
            .request_disconnect(DisconnectReason::UserRequested, None)
            .await;

        let stats = manager.stats();
        assert_eq!(stats.disconnects, 1, "second disconnect must be a no-op");
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn killed_reason_closes_despite_auto_reconnect() {
        let server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await.unwrap();
        manager
            .request_disconnect(DisconnectReason::Killed, None)
            .await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        let stats = manager.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.reactive_disconnects, 1, "KILLED is externally imposed");
        assert_eq!(stats.proactive_disconnects, 0);
    }

    #[tokio::test]
    async fn second_connect_while_connected_is_rejected() {
        let server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await.unwrap();
        let err = manager.connect().await.expect_err("already connected");
        assert_eq!(err.kind(), sockline::error::Kind::State);
    }

    #[tokio::test]
    async fn on_disconnect_hook_sees_the_reason() {
        let server = MockWsServer::start().await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let hook: Arc<dyn DisconnectHook> = Arc::new(move |reason: DisconnectReason| {
            sink.lock().unwrap().push(reason);
        });

        let mut config = fast_config();
        config.auto_reconnect = false;
        let manager = WebSocketManager::new(
            ManagerOptions::builder()
                .url(server.ws_url())
                .config(config)
                .on_disconnect(hook)
                .build(),
        )
        .unwrap();

        manager.connect().await.unwrap();
        manager.disconnect().await;

        assert_eq!(*seen.lock().unwrap(), vec![DisconnectReason::UserRequested]);
    }
}

mod connect_failures {
    use sockline::error::{ConnectionFailed, Kind, ReconnectExhausted};

    use super::*;

    #[tokio::test]
    async fn refused_connect_without_auto_reconnect_closes() {
        let mut config = fast_config();
        config.auto_reconnect = false;
        // Port 1 on loopback refuses immediately.
        let manager = manager_for("ws://127.0.0.1:1/stream".to_owned(), config);

        let err = manager.connect().await.expect_err("nothing listening");
        assert_eq!(err.kind(), Kind::Connection);
        let failure = err.downcast_ref::<ConnectionFailed>().expect("downcast");
        assert_eq!(failure.attempts, 1);
        assert!(failure.last_error.is_some());

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.stats().connects, 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_reconnect_error() {
        let mut config = fast_config();
        config.reconnect.max_attempts = Some(2);
        let manager = manager_for("ws://127.0.0.1:1/stream".to_owned(), config);

        let err = manager.connect().await.expect_err("retries must give up");
        assert_eq!(err.kind(), Kind::Reconnect);
        let exhausted = err.downcast_ref::<ReconnectExhausted>().expect("downcast");
        assert_eq!(exhausted.attempts, 2);

        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn reactive_loss_triggers_immediate_reconnect() {
        init_tracing();
        let server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await.unwrap();
        server.kill_connections();

        assert!(
            wait_until(|| manager.stats().connects >= 2).await,
            "manager should reconnect after the server drops the link"
        );
        wait_for_state(&manager, ConnectionState::Connected).await;

        let stats = manager.stats();
        assert!(stats.reactive_disconnects >= 1, "loss must count as reactive");
        assert_eq!(stats.proactive_disconnects, 0);
        assert!(server.connection_count() >= 2);
    }

    #[tokio::test]
    async fn reconnect_after_overrides_policy_delay() {
        let server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await.unwrap();
        manager
            .request_disconnect(DisconnectReason::Scheduled, Some(Duration::from_millis(50)))
            .await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        assert!(
            wait_until(|| manager.stats().connects >= 2).await,
            "override delay should lead to a second connection"
        );
        assert_eq!(manager.stats().proactive_disconnects, 1);
    }

    #[tokio::test]
    async fn schedule_reconnect_connects_from_idle() {
        let server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.schedule_reconnect(Duration::from_millis(20)).await;
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.stats().connects, 1);
    }

    #[tokio::test]
    async fn connection_limit_cycles_before_the_deadline() {
        let server = MockWsServer::start().await;
        let mut config = fast_config();
        config.disconnect_margin = Duration::from_millis(400);
        let manager = manager_for(server.ws_url(), config);

        manager.connect().await.unwrap();
        manager.advertise_connection_limit(Duration::from_millis(500));

        // Proactive cycle fires at limit - margin = 100ms into the connection.
        assert!(
            wait_until(|| {
                let stats = manager.stats();
                stats.connects >= 2 && stats.proactive_disconnects >= 1
            })
            .await,
            "limit minus margin should force an early proactive reconnect"
        );
        assert_eq!(manager.stats().reactive_disconnects, 0);
    }
}

mod messaging {
    use super::*;

    #[tokio::test]
    async fn send_and_receive_update_traffic_accounting() {
        let mut server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await.unwrap();

        manager.send("hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), "hello");

        server.send("worlds!");
        let messages = manager.messages();
        let received = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Payload::Text("worlds!".to_owned()));

        let stats = manager.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, 5);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 7);
        assert!(stats.last_message_time.is_some());
    }

    #[tokio::test]
    async fn send_json_serializes_to_text() -> anyhow::Result<()> {
        let mut server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await?;
        manager
            .send_json(&serde_json::json!({"op": "subscribe"}))
            .await?;

        let wire = server.recv().await.unwrap();
        assert_eq!(wire, r#"{"op":"subscribe"}"#);
        Ok(())
    }

    #[tokio::test]
    async fn send_fails_while_not_connected() {
        let server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        let err = manager.send("early").await.expect_err("not connected yet");
        assert_eq!(err.kind(), sockline::error::Kind::Closed);
    }

    #[tokio::test]
    async fn consumer_handle_survives_reconnect() {
        let mut server = MockWsServer::start().await;
        let manager = manager_for(server.ws_url(), fast_config());

        manager.connect().await.unwrap();
        let messages = manager.messages();

        // Round-trip one message so the first connection is fully wired up.
        manager.send("sync").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), "sync");

        server.send("before");
        let first = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Payload::Text("before".to_owned()));

        server.kill_connections();
        assert!(wait_until(|| manager.stats().connects >= 2).await);
        wait_for_state(&manager, ConnectionState::Connected).await;

        manager.send("sync2").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), "sync2");

        server.send("after");
        let second = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, Payload::Text("after".to_owned()));
    }
}

mod proactive_control {
    use super::*;

    #[tokio::test]
    async fn disconnect_predicate_forces_a_proactive_cycle() {
        let server = MockWsServer::start().await;
        let armed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&armed);
        // Fires once, then disarms so the reconnected link stays up.
        let predicate: Arc<dyn DisconnectPredicate> =
            Arc::new(move || flag.swap(false, Ordering::SeqCst));

        let manager = WebSocketManager::new(
            ManagerOptions::builder()
                .url(server.ws_url())
                .config(fast_config())
                .should_disconnect(predicate)
                .build(),
        )
        .unwrap();

        manager.connect().await.unwrap();
        armed.store(true, Ordering::SeqCst);

        assert!(
            wait_until(|| manager.stats().proactive_disconnects >= 1).await,
            "predicate should trigger a proactive disconnect"
        );
        assert!(wait_until(|| manager.stats().connects >= 2).await);
        wait_for_state(&manager, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn reconnect_window_polls_until_proceed() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let predicate: Arc<dyn sockline::ReconnectPredicate> = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ReconnectSignal::HoldFor(Duration::from_millis(10))
            } else {
                ReconnectSignal::Proceed
            }
        });

        let manager = WebSocketManager::new(
            ManagerOptions::builder()
                .url("ws://127.0.0.1:1/stream")
                .config(fast_config())
                .should_reconnect(predicate)
                .build(),
        )
        .unwrap();

        let allowed = manager
            .wait_for_reconnect_window(None, Some(Duration::from_secs(2)))
            .await;
        assert!(allowed, "predicate eventually proceeds");
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn reconnect_window_without_predicate_returns_false() {
        let manager = manager_for("ws://127.0.0.1:1/stream".to_owned(), fast_config());

        let allowed = manager.wait_for_reconnect_window(None, None).await;
        assert!(!allowed, "no predicate means no window");
    }
}
