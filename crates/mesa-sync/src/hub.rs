//! # Hub Server
//!
//! The WebSocket server every device connects to. The hub's own store is
//! authoritative: edits are persisted first, then the canonical post-write
//! state fans out to every connected device.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Hub Architecture                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      HubServer (Axum)                           │   │
//! │  │                                                                 │   │
//! │  │  /ws endpoint ──▶ WebSocket upgrade                            │   │
//! │  │  /api/*       ──▶ JSON replay surface (api.rs)                 │   │
//! │  │                        │                                        │   │
//! │  │                        ▼                                        │   │
//! │  │              ┌─────────────────┐         ┌──────────────────┐  │   │
//! │  │              │ per-connection  │ ──────▶ │  Active-Order    │  │   │
//! │  │              │ handler         │ persist │  Store (SQLite)  │  │   │
//! │  │              └────────┬────────┘         └────────┬─────────┘  │   │
//! │  │                       │ read back                 │            │   │
//! │  │                       ▼                           ▼            │   │
//! │  │              StateBroadcast to ALL connected devices           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Message Flow:                                                          │
//! │  ─────────────                                                          │
//! │  1. Device connects with Hello; hub answers Welcome + current state    │
//! │  2. Edit ──▶ persist ──▶ StateBroadcast (never optimistic)             │
//! │  3. RequestState answered straight from the store                      │
//! │  4. AnnounceLeader / StateSnapshot kept as the legacy compat path      │
//! │  5. Periodic pings keep connections alive                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use mesa_db::Database;

use crate::api::{self, ApiContext};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::leader::LeaderLease;
use crate::protocol::{
    HelloPayload, ReplicaMessage, StatePayload, WelcomePayload, PROTOCOL_VERSION,
};

// =============================================================================
// Constants
// =============================================================================

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long a fresh connection gets to say Hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Connected Client
// =============================================================================

/// A connected device.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Hub-local connection id.
    pub connection_id: u64,
    /// Device ID.
    pub device_id: String,
    /// Client address.
    pub addr: SocketAddr,
    /// Connection time.
    pub connected_at: std::time::Instant,
}

// =============================================================================
// Hub State
// =============================================================================

/// Shared state for the hub server.
pub struct HubState {
    /// Sync configuration.
    config: Arc<SyncConfig>,
    /// The authoritative store.
    db: Arc<Database>,
    /// Compat-path leader reference.
    lease: LeaderLease,
    /// Shared with the HTTP routes; owns the broadcast channel.
    api: Arc<ApiContext>,
    /// Connected clients, keyed by connection id.
    clients: RwLock<HashMap<u64, ConnectedClient>>,
    /// Connection id source.
    next_connection_id: AtomicU64,
}

impl HubState {
    fn new(config: Arc<SyncConfig>, db: Arc<Database>) -> Self {
        let (events, _) = broadcast::channel(256);
        let api = Arc::new(ApiContext {
            db: db.clone(),
            events,
        });
        HubState {
            config,
            db,
            lease: LeaderLease::new(),
            api,
            clients: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Broadcasts a message to all connected clients.
    pub fn broadcast(&self, msg: ReplicaMessage) {
        let _ = self.api.events.send(msg);
    }

    /// Returns the number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Returns the connected device ids.
    pub async fn client_ids(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| c.device_id.clone())
            .collect()
    }
}

// =============================================================================
// Hub Server
// =============================================================================

/// The hub server: WebSocket fanout plus the HTTP replay surface.
pub struct HubServer {
    state: Arc<HubState>,
}

/// Handle for controlling a running hub.
#[derive(Clone)]
pub struct HubHandle {
    state: Arc<HubState>,
    shutdown_tx: mpsc::Sender<()>,
}

impl HubHandle {
    /// Broadcasts a message to all connected clients.
    pub fn broadcast(&self, msg: ReplicaMessage) {
        self.state.broadcast(msg)
    }

    /// Returns the number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.state.client_count().await
    }

    /// Returns the connected device ids.
    pub async fn client_ids(&self) -> Vec<String> {
        self.state.client_ids().await
    }

    /// The compat-path leader, if any device announced.
    pub async fn current_leader(&self) -> Option<String> {
        self.state.lease.current_device().await
    }

    /// Shuts down the hub server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Hub shutdown channel closed".into()))
    }
}

impl HubServer {
    pub fn new(config: Arc<SyncConfig>, db: Arc<Database>) -> Self {
        let state = Arc::new(HubState::new(config, db));
        HubServer { state }
    }

    /// Binds the listener and returns a handle once the server is up.
    pub async fn start(self) -> SyncResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = HubHandle {
            state: self.state.clone(),
            shutdown_tx,
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
            .merge(api::router(self.state.api.clone()));

        let bind_addr = self.state.config.hub.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {bind_addr}: {e}"))
        })?;

        info!(addr = %bind_addr, "Hub server started");

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Hub server shutting down");
            })
            .await
            .ok();
        });

        Ok(handle)
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!(addr = %addr, "New WebSocket connection");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handles one device connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<HubState>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    let hello = match receive_hello(&mut receiver).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(addr = %addr, %e, "Failed to receive Hello, closing connection");
            return;
        }
    };
    let device_id = hello.device_id.clone();

    if hello.store_id != state.config.store_id() {
        warn!(
            device_id = %device_id,
            client_store = %hello.store_id,
            our_store = %state.config.store_id(),
            "Store ID mismatch, rejecting connection"
        );
        send_message(
            &mut sender,
            &ReplicaMessage::Error {
                code: "STORE_MISMATCH".to_string(),
                message: "Store ID does not match".to_string(),
            },
        )
        .await
        .ok();
        return;
    }

    // v1 clients speak the leader compat path; anything newer than us is
    // a device we cannot safely talk to.
    if hello.protocol_version == 0 || hello.protocol_version > PROTOCOL_VERSION {
        warn!(
            device_id = %device_id,
            version = hello.protocol_version,
            "Unsupported protocol version, rejecting connection"
        );
        send_message(
            &mut sender,
            &ReplicaMessage::Error {
                code: "UNSUPPORTED_VERSION".to_string(),
                message: format!("Protocol version {} not supported", hello.protocol_version),
            },
        )
        .await
        .ok();
        return;
    }

    let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    info!(
        device_id = %device_id,
        connection_id,
        addr = %addr,
        "Client authenticated"
    );

    {
        let mut clients = state.clients.write().await;
        clients.insert(
            connection_id,
            ConnectedClient {
                connection_id,
                device_id: device_id.clone(),
                addr,
                connected_at: std::time::Instant::now(),
            },
        );
    }

    let welcome = ReplicaMessage::Welcome(WelcomePayload {
        hub_device_id: state.config.device_id().to_string(),
        store_id: state.config.store_id().to_string(),
        leader_device_id: state.lease.current_device().await,
        server_time: chrono::Utc::now().to_rfc3339(),
    });
    if let Err(e) = send_message(&mut sender, &welcome).await {
        warn!(device_id = %device_id, %e, "Failed to send Welcome");
        remove_client(&state, connection_id).await;
        return;
    }

    // Subscribe before the initial snapshot so no broadcast slips
    // between the two.
    let mut broadcast_rx = state.api.events.subscribe();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(64);

    // A fresh device converges immediately instead of waiting for the
    // next mutation.
    match state.db.active_orders().get_all().await {
        Ok(orders) => {
            let snapshot = ReplicaMessage::StateBroadcast(StatePayload { orders });
            if let Err(e) = send_message(&mut sender, &snapshot).await {
                warn!(device_id = %device_id, %e, "Failed to send initial state");
                remove_client(&state, connection_id).await;
                return;
            }
        }
        Err(e) => warn!(device_id = %device_id, %e, "Failed to load initial state"),
    }

    // Outgoing writer task
    let outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Broadcast forwarding task
    let forward_device_id = device_id.clone();
    let outgoing_tx_clone = outgoing_tx.clone();
    let broadcast_handle = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(msg) => {
                    if let Ok(json) = serde_json::to_string(&msg) {
                        if outgoing_tx_clone.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // A lagged client will catch up on the next
                    // full-state broadcast anyway.
                    warn!(device_id = %forward_device_id, "Broadcast receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Ping task
    let outgoing_tx_ping = outgoing_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        loop {
            ping_interval.tick().await;
            if outgoing_tx_ping
                .send(Message::Ping(axum::body::Bytes::new()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Main receive loop
    loop {
        match receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => match serde_json::from_str::<ReplicaMessage>(&text) {
                    Ok(msg) => {
                        handle_client_message(&state, connection_id, &device_id, msg, &outgoing_tx)
                            .await
                    }
                    Err(e) => {
                        debug!(device_id = %device_id, %e, "Invalid message format");
                    }
                },
                Message::Binary(data) => match serde_json::from_slice::<ReplicaMessage>(&data) {
                    Ok(msg) => {
                        handle_client_message(&state, connection_id, &device_id, msg, &outgoing_tx)
                            .await
                    }
                    Err(e) => {
                        debug!(device_id = %device_id, %e, "Invalid binary message");
                    }
                },
                Message::Pong(_) => {
                    // Connection is alive
                }
                Message::Ping(data) => {
                    let _ = outgoing_tx.send(Message::Pong(data)).await;
                }
                Message::Close(_) => {
                    info!(device_id = %device_id, "Client requested close");
                    break;
                }
            },
            Some(Err(e)) => {
                warn!(device_id = %device_id, %e, "WebSocket error");
                break;
            }
            None => {
                info!(device_id = %device_id, "Client disconnected");
                break;
            }
        }
    }

    // Cleanup
    ping_handle.abort();
    broadcast_handle.abort();
    outgoing_handle.abort();
    state.lease.release_connection(connection_id).await;
    remove_client(&state, connection_id).await;
}

/// Receives and parses the Hello message.
async fn receive_hello(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> SyncResult<HelloPayload> {
    let timeout = tokio::time::timeout(HELLO_TIMEOUT, receiver.next()).await;

    match timeout {
        Ok(Some(Ok(msg))) => {
            let text = match msg {
                Message::Text(t) => t.to_string(),
                Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                _ => return Err(SyncError::InvalidMessage("Expected text message".into())),
            };

            let msg: ReplicaMessage = serde_json::from_str(&text)
                .map_err(|e| SyncError::InvalidMessage(format!("Invalid JSON: {e}")))?;

            match msg {
                ReplicaMessage::Hello(payload) => Ok(payload),
                other => Err(SyncError::UnexpectedMessageType {
                    expected: "Hello".to_string(),
                    actual: other.kind().to_string(),
                }),
            }
        }
        Ok(Some(Err(e))) => Err(SyncError::WebSocketError(e.to_string())),
        Ok(None) => Err(SyncError::Disconnected),
        Err(_) => Err(SyncError::Timeout(HELLO_TIMEOUT.as_secs())),
    }
}

/// Sends one message over a split sink.
async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ReplicaMessage,
) -> SyncResult<()> {
    let json = serde_json::to_string(msg)?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::WebSocketError(e.to_string()))?;
    Ok(())
}

/// Per-message dispatch after the handshake.
async fn handle_client_message(
    state: &HubState,
    connection_id: u64,
    device_id: &str,
    msg: ReplicaMessage,
    outgoing_tx: &mpsc::Sender<Message>,
) {
    debug!(device_id = %device_id, kind = msg.kind(), "Received client message");

    match msg {
        ReplicaMessage::Edit(edit) => {
            match state
                .db
                .active_orders()
                .upsert(edit.table_id, &edit.session_id, &edit.lines)
                .await
            {
                Ok(()) => state.api.broadcast_state().await,
                Err(e) => {
                    warn!(device_id = %device_id, table_id = edit.table_id, %e, "Edit rejected");
                    send_to(
                        outgoing_tx,
                        &ReplicaMessage::Error {
                            code: "EDIT_REJECTED".to_string(),
                            message: e.to_string(),
                        },
                    )
                    .await;
                }
            }
        }

        ReplicaMessage::RequestState { .. } => {
            // Answered straight from the store; no leader round-trip.
            match state.db.active_orders().get_all().await {
                Ok(orders) => {
                    send_to(
                        outgoing_tx,
                        &ReplicaMessage::StateBroadcast(StatePayload { orders }),
                    )
                    .await;
                }
                Err(e) => warn!(device_id = %device_id, %e, "Failed to answer RequestState"),
            }
        }

        ReplicaMessage::AnnounceLeader { device_id: announced } => {
            if announced != device_id {
                warn!(
                    device_id = %device_id,
                    announced = %announced,
                    "AnnounceLeader for a different device, ignoring"
                );
                return;
            }
            state.lease.acquire(connection_id, device_id).await;
        }

        ReplicaMessage::StateSnapshot(snapshot) => {
            // Legacy leader push: merge by table key so unrelated tables
            // are never overwritten.
            if state.lease.current_device().await.as_deref() != Some(device_id) {
                warn!(device_id = %device_id, "StateSnapshot from non-leader, ignoring");
                return;
            }
            let repo = state.db.active_orders();
            let mut merged = 0usize;
            for order in snapshot.orders {
                match repo
                    .upsert(order.table_id, &order.session_id, &order.lines)
                    .await
                {
                    Ok(()) => merged += 1,
                    Err(e) => {
                        warn!(table_id = order.table_id, %e, "Snapshot table rejected")
                    }
                }
            }
            if merged > 0 {
                state.api.broadcast_state().await;
            }
        }

        ReplicaMessage::Ping { timestamp } => {
            send_to(
                outgoing_tx,
                &ReplicaMessage::Pong {
                    ping_timestamp: timestamp,
                    pong_timestamp: chrono::Utc::now().to_rfc3339(),
                },
            )
            .await;
        }

        ReplicaMessage::Pong { .. } => {
            // Connection is alive
        }

        other => {
            debug!(device_id = %device_id, kind = other.kind(), "Ignoring message kind");
        }
    }
}

async fn send_to(outgoing_tx: &mpsc::Sender<Message>, msg: &ReplicaMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = outgoing_tx.send(Message::Text(json.into())).await;
    }
}

/// Removes a client from the connected list.
async fn remove_client(state: &HubState, connection_id: u64) {
    let mut clients = state.clients.write().await;
    if let Some(client) = clients.remove(&connection_id) {
        info!(device_id = %client.device_id, connection_id, "Client removed");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_core::{Money, OrderLine, SessionId};
    use mesa_db::DbConfig;

    async fn test_state() -> Arc<HubState> {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let config = Arc::new(SyncConfig::new());
        Arc::new(HubState::new(config, Arc::new(db)))
    }

    fn edit(table_id: i64) -> ReplicaMessage {
        ReplicaMessage::Edit(crate::protocol::EditPayload {
            table_id,
            session_id: SessionId::generate(),
            lines: vec![OrderLine::new("1", "Espresso", Money::from_cents(250), 1)],
        })
    }

    #[tokio::test]
    async fn test_edit_persists_then_broadcasts() {
        let state = test_state().await;
        let mut events = state.api.events.subscribe();
        let (outgoing_tx, _outgoing_rx) = mpsc::channel(8);

        handle_client_message(&state, 1, "dev-a", edit(5), &outgoing_tx).await;

        // The broadcast carries what the store persisted.
        match events.recv().await.unwrap() {
            ReplicaMessage::StateBroadcast(payload) => {
                assert_eq!(payload.orders.len(), 1);
                assert_eq!(payload.orders[0].table_id, 5);
            }
            other => panic!("wrong message kind: {}", other.kind()),
        }
        let stored = state.db.active_orders().get(5).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_request_state_answered_from_store() {
        let state = test_state().await;
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(8);

        let session = SessionId::generate();
        let lines = vec![OrderLine::new("2", "Latte", Money::from_cents(420), 1)];
        state
            .db
            .active_orders()
            .upsert(3, &session, &lines)
            .await
            .unwrap();

        handle_client_message(
            &state,
            1,
            "dev-a",
            ReplicaMessage::RequestState {
                device_id: "dev-a".to_string(),
            },
            &outgoing_tx,
        )
        .await;

        let reply = outgoing_rx.recv().await.unwrap();
        let text = match reply {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        };
        let msg: ReplicaMessage = serde_json::from_str(&text).unwrap();
        match msg {
            ReplicaMessage::StateBroadcast(payload) => {
                assert_eq!(payload.orders.len(), 1);
                assert_eq!(payload.orders[0].table_id, 3);
            }
            other => panic!("wrong message kind: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_announce_leader_takes_lease_for_self_only() {
        let state = test_state().await;
        let (outgoing_tx, _rx) = mpsc::channel(8);

        // Announcing on someone else's behalf is ignored.
        handle_client_message(
            &state,
            1,
            "dev-a",
            ReplicaMessage::AnnounceLeader {
                device_id: "dev-b".to_string(),
            },
            &outgoing_tx,
        )
        .await;
        assert!(state.lease.current().await.is_none());

        handle_client_message(
            &state,
            1,
            "dev-a",
            ReplicaMessage::AnnounceLeader {
                device_id: "dev-a".to_string(),
            },
            &outgoing_tx,
        )
        .await;
        assert_eq!(state.lease.current_device().await.as_deref(), Some("dev-a"));
    }

    #[tokio::test]
    async fn test_snapshot_merges_by_table_without_clobbering() {
        let state = test_state().await;
        let (outgoing_tx, _rx) = mpsc::channel(8);

        // Table 1 exists already; the leader's snapshot only mentions
        // table 2 and must leave table 1 alone.
        let session = SessionId::generate();
        let lines = vec![OrderLine::new("1", "Espresso", Money::from_cents(250), 1)];
        state
            .db
            .active_orders()
            .upsert(1, &session, &lines)
            .await
            .unwrap();

        handle_client_message(
            &state,
            7,
            "dev-leader",
            ReplicaMessage::AnnounceLeader {
                device_id: "dev-leader".to_string(),
            },
            &outgoing_tx,
        )
        .await;

        let snapshot_order = mesa_core::ActiveOrder::new(
            2,
            SessionId::generate(),
            vec![OrderLine::new("3", "Mocha", Money::from_cents(450), 2)],
        );
        handle_client_message(
            &state,
            7,
            "dev-leader",
            ReplicaMessage::StateSnapshot(StatePayload {
                orders: vec![snapshot_order],
            }),
            &outgoing_tx,
        )
        .await;

        let all = state.db.active_orders().get_all().await.unwrap();
        assert_eq!(all.len(), 2);

        // A snapshot from a device without the lease is discarded.
        handle_client_message(
            &state,
            9,
            "dev-imposter",
            ReplicaMessage::StateSnapshot(StatePayload {
                orders: vec![mesa_core::ActiveOrder::new(
                    1,
                    SessionId::generate(),
                    vec![],
                )],
            }),
            &outgoing_tx,
        )
        .await;
        assert!(state.db.active_orders().get(1).await.unwrap().is_some());
    }
}
