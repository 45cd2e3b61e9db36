//! # WebSocket Transport
//!
//! Device-side WebSocket client with automatic reconnection and backoff.
//! Performs the Hello/Welcome handshake itself; a connection only counts
//! as `Connected` once the hub has welcomed it.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │──── Hello/Welcome ──┐   │
//! │  └────────────┘                 └─────┬──────┘                     │   │
//! │        ▲                              │ failure                    ▼   │
//! │        │                              ▼                  ┌────────────┐│
//! │        │                        ┌────────────┐           │ Connected  ││
//! │        │                        │  Backoff   │           └─────┬──────┘│
//! │        │                        └─────┬──────┘    disconnect   │       │
//! │        │                              │◄──────────────────────-┘       │
//! │        │                              │ timer expired                  │
//! │        │                              ▼                                │
//! │        └──────────────────────  Reconnecting                           │
//! │                                                                         │
//! │  BACKOFF: exponential with jitter, 500ms → … → 60s cap                 │
//! │  The agent watches the state channel and drains its mutation queue     │
//! │  on every Disconnected→Connected transition.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{HelloPayload, ReplicaMessage};

// =============================================================================
// Transport State
// =============================================================================

/// Connection state for the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect (TCP + handshake).
    Connecting,
    /// Welcomed by the hub and ready.
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hub WebSocket URL.
    pub url: String,

    /// Handshake identity sent on every (re)connect.
    pub hello: HelloPayload,

    /// Whether to announce leadership right after the handshake
    /// (legacy compat path, fixed devices only).
    pub announce_leader: bool,

    /// Connection timeout, also bounds the Welcome wait.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Maximum reconnection attempts (0 = infinite).
    pub max_retries: u32,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, hello: HelloPayload) -> Self {
        TransportConfig {
            url: url.into(),
            hello,
            announce_leader: false,
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0,
            ping_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for interacting with the transport from other components.
#[derive(Clone)]
pub struct TransportHandle {
    outgoing_tx: mpsc::Sender<ReplicaMessage>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: mpsc::Sender<()>,
}

impl TransportHandle {
    /// Sends a message through the transport.
    pub async fn send(&self, message: ReplicaMessage) -> SyncResult<()> {
        self.outgoing_tx
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelError("Transport outgoing channel closed".into()))
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Returns true if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A watch receiver for observing state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Transport shutdown channel closed".into()))
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport with automatic reconnection.
pub struct Transport {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    outgoing_rx: mpsc::Receiver<ReplicaMessage>,
    incoming_tx: mpsc::Sender<ReplicaMessage>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Transport {
    /// Creates a transport and spawns its background task.
    ///
    /// Returns a handle for sending and a receiver for incoming messages.
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<ReplicaMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<ReplicaMessage>(100);
        let (incoming_tx, incoming_rx) = mpsc::channel::<ReplicaMessage>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let transport = Transport {
            config,
            state_tx,
            outgoing_rx,
            incoming_tx,
            shutdown_rx,
        };

        tokio::spawn(transport.run());

        let handle = TransportHandle {
            outgoing_tx,
            state_rx,
            shutdown_tx,
        };

        (handle, incoming_rx)
    }

    /// Main transport loop: connect, handshake, pump, back off, repeat.
    async fn run(mut self) {
        info!(url = %self.config.url, "Transport starting");

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Transport received shutdown signal");
                break;
            }

            let _ = self.state_tx.send(ConnectionState::Connecting);

            match self.connect_and_handshake().await {
                Ok(ws_stream) => {
                    info!("Connected and welcomed by hub");
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    backoff.reset();
                    retry_count = 0;

                    if let Err(e) = self.connection_loop(ws_stream).await {
                        warn!(%e, "Connection loop ended");
                    } else {
                        // Clean close requested; don't reconnect.
                        break;
                    }
                }
                Err(e) => {
                    error!(%e, "Failed to connect");
                }
            }

            let _ = self.state_tx.send(ConnectionState::Backoff);

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            match backoff.next_backoff() {
                Some(duration) => {
                    debug!(?duration, attempt = retry_count, "Waiting before reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            let _ = self.state_tx.send(ConnectionState::Reconnecting);
                        }
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown during backoff");
                            break;
                        }
                    }
                }
                None => {
                    error!("Backoff exhausted");
                    break;
                }
            }
        }

        let _ = self.state_tx.send(ConnectionState::Disconnected);
        info!("Transport stopped");
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Connects, says Hello and waits for Welcome.
    async fn connect_and_handshake(
        &mut self,
    ) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let connect_future = connect_async(&self.config.url);
        let mut ws_stream = match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => return Err(SyncError::from(e)),
            Err(_) => return Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        };

        let hello = ReplicaMessage::Hello(self.config.hello.clone());
        ws_stream
            .send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
            .await?;

        // The hub answers Welcome (or Error) before anything else.
        let welcome = timeout(self.config.connect_timeout, ws_stream.next()).await;
        match welcome {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                match serde_json::from_str::<ReplicaMessage>(&text)? {
                    ReplicaMessage::Welcome(payload) => {
                        info!(
                            hub = %payload.hub_device_id,
                            leader = ?payload.leader_device_id,
                            "Welcomed by hub"
                        );
                        // Forward so the agent sees the leader reference.
                        let _ = self
                            .incoming_tx
                            .send(ReplicaMessage::Welcome(payload))
                            .await;
                    }
                    ReplicaMessage::Error { code, message } => {
                        return Err(SyncError::ConnectionFailed(format!(
                            "Hub rejected connection ({code}): {message}"
                        )));
                    }
                    other => {
                        return Err(SyncError::UnexpectedMessageType {
                            expected: "Welcome".to_string(),
                            actual: other.kind().to_string(),
                        });
                    }
                }
            }
            Ok(Some(Ok(_))) => {
                return Err(SyncError::InvalidMessage("Expected text frame".into()))
            }
            Ok(Some(Err(e))) => return Err(SyncError::from(e)),
            Ok(None) => return Err(SyncError::Disconnected),
            Err(_) => return Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }

        if self.config.announce_leader {
            let announce = ReplicaMessage::AnnounceLeader {
                device_id: self.config.hello.device_id.clone(),
            };
            ws_stream
                .send(WsMessage::Text(serde_json::to_string(&announce)?.into()))
                .await?;
        }

        Ok(ws_stream)
    }

    /// Pumps messages both ways until the connection drops.
    async fn connection_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SyncResult<()> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                Some(msg) = self.outgoing_rx.recv() => {
                    let json = serde_json::to_string(&msg)?;
                    debug!(kind = msg.kind(), "Sending message");
                    write.send(WsMessage::Text(json.into())).await?;
                }

                Some(result) = read.next() => {
                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<ReplicaMessage>(&text) {
                                Ok(msg) => {
                                    debug!(kind = msg.kind(), "Received message");
                                    if self.incoming_tx.send(msg).await.is_err() {
                                        warn!("Incoming message receiver dropped");
                                        return Err(SyncError::ChannelError(
                                            "Receiver dropped".into(),
                                        ));
                                    }
                                }
                                Err(e) => {
                                    warn!(%e, "Failed to parse message");
                                }
                            }
                        }
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Received close frame");
                            return Err(SyncError::Disconnected);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Received unexpected binary message");
                        }
                        Ok(WsMessage::Frame(_)) => {
                            // Raw frame, ignore
                        }
                        Err(e) => {
                            error!(%e, "WebSocket error");
                            return Err(SyncError::from(e));
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(vec![].into())).await?;
                    debug!("Sent ping");
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let hello = HelloPayload::new("dev-1", "Counter", "store-1");
        let config = TransportConfig::new("ws://localhost:8765/ws", hello);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert!(!config.announce_leader);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[tokio::test]
    async fn test_connect_failure_enters_backoff() {
        let hello = HelloPayload::new("dev-1", "Counter", "store-1");
        let mut config = TransportConfig::new("ws://127.0.0.1:1/ws", hello);
        config.max_retries = 1;
        config.connect_timeout = Duration::from_millis(200);

        let (handle, _incoming) = Transport::spawn(config);
        let mut state_rx = handle.watch_state();

        // Nothing listens on port 1; the transport must give up after
        // its single permitted attempt and settle on Disconnected.
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                state_rx.changed().await.unwrap();
                if *state_rx.borrow() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await;
        assert!(deadline.is_ok());
        assert!(!handle.is_connected());
    }
}
