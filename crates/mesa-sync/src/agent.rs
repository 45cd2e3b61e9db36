//! # Sync Agent
//!
//! Device-side orchestrator: owns the transport, the durable mutation
//! queue and the last-known-state cache.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • Online edits go straight over the WebSocket                   │  │
//! │  │  • Offline edits land in the durable mutation queue              │  │
//! │  │  • Reconnect (and a periodic tick) triggers a queue drain        │  │
//! │  │  • StateBroadcast REPLACES the local cache: devices converge     │  │
//! │  │    to the last durably written value, not the last value sent    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Transport    │  │ MutationQueue  │  │  Order cache           │    │
//! │  │   (WebSocket)  │  │                │  │                        │    │
//! │  │ auto-reconnect │  │ durable FIFO,  │  │ table_id → ActiveOrder │    │
//! │  │ + state watch  │  │ replay via     │  │ replaced wholesale on  │    │
//! │  │                │  │ RemoteApi      │  │ every broadcast        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use mesa_core::{ActiveOrder, MutationOp, OrderLine, SessionId};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{HelloPayload, ReplicaMessage};
use crate::queue::{DrainOutcome, MutationQueue};
use crate::remote::RemoteApi;
use crate::transport::{ConnectionState, Transport, TransportConfig, TransportHandle};

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current connection state.
    pub connection_state: ConnectionState,

    /// Whether currently connected to the hub.
    pub is_connected: bool,

    /// URL of the configured hub (if any).
    pub hub_url: Option<String>,

    /// Number of pending queue entries.
    pub pending_count: usize,

    /// Last successful drain timestamp (RFC 3339).
    pub last_drain: Option<String>,

    /// Last error message (if any).
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            connection_state: ConnectionState::Disconnected,
            is_connected: false,
            hub_url: None,
            pending_count: 0,
            last_drain: None,
            last_error: None,
        }
    }
}

/// Events the agent republishes for the UI layer.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The order cache was replaced with fresh canonical state.
    StateChanged,

    /// A sale was committed somewhere in the store.
    SaleFinalized { sale_id: i64, table_id: i64 },

    /// Connection state changed.
    Connection(ConnectionState),
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Device-side replication orchestrator.
pub struct SyncAgent {
    /// Sync configuration.
    config: Arc<SyncConfig>,

    /// Durable mutation queue.
    queue: Arc<MutationQueue>,

    /// Replay target for queued mutations.
    remote: Arc<dyn RemoteApi>,

    /// Current sync status.
    status: Arc<RwLock<SyncStatus>>,

    /// Last-known canonical state, keyed by table.
    orders: Arc<RwLock<HashMap<i64, ActiveOrder>>>,

    /// Event fanout for the UI layer.
    events: broadcast::Sender<AgentEvent>,

    /// Transport handle (set after start).
    transport: Option<TransportHandle>,

    /// Shutdown sender for the background tasks.
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl SyncAgent {
    pub fn new(
        config: Arc<SyncConfig>,
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteApi>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        SyncAgent {
            config,
            queue,
            remote,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            orders: Arc::new(RwLock::new(HashMap::new())),
            events,
            transport: None,
            shutdown_tx: None,
        }
    }

    /// Returns the current sync status.
    pub async fn status(&self) -> SyncStatus {
        let mut status = self.status.read().await.clone();
        status.pending_count = self.queue.pending().await.unwrap_or(status.pending_count);
        status
    }

    /// Snapshot of the last-known active orders.
    pub async fn orders(&self) -> Vec<ActiveOrder> {
        let mut orders: Vec<_> = self.orders.read().await.values().cloned().collect();
        orders.sort_by_key(|o| o.table_id);
        orders
    }

    /// Subscribes to agent events.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Starts the background tasks.
    pub async fn start(&mut self) -> SyncResult<()> {
        self.config.validate()?;

        let hub_url = match self.config.hub_url() {
            Some(url) => url.to_string(),
            None => {
                warn!("No hub URL configured, replication will not start");
                return Err(SyncError::InvalidConfig("Hub URL required".into()));
            }
        };

        info!(
            device_id = %self.config.device_id(),
            hub_url = %hub_url,
            "Starting sync agent"
        );

        let hello = HelloPayload {
            device_id: self.config.device_id().to_string(),
            device_name: self.config.device.name.clone(),
            store_id: self.config.store_id().to_string(),
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            announces_leader: self.config.announces_leader(),
        };
        let mut transport_config = TransportConfig::new(hub_url.clone(), hello);
        transport_config.announce_leader = self.config.announces_leader();
        transport_config.connect_timeout =
            Duration::from_secs(self.config.sync.connect_timeout_secs);
        transport_config.initial_backoff =
            Duration::from_millis(self.config.sync.initial_backoff_ms);
        transport_config.max_backoff = Duration::from_secs(self.config.sync.max_backoff_secs);

        let (transport_handle, incoming_rx) = Transport::spawn(transport_config);
        self.transport = Some(transport_handle.clone());

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(Self::message_router(
            self.orders.clone(),
            self.status.clone(),
            self.events.clone(),
            incoming_rx,
            shutdown_rx,
        ));

        tokio::spawn(Self::drain_loop(
            self.queue.clone(),
            self.remote.clone(),
            self.status.clone(),
            transport_handle,
            Duration::from_secs(self.config.sync.drain_interval_secs),
        ));

        {
            let mut s = self.status.write().await;
            s.hub_url = Some(hub_url);
        }

        info!("Sync agent started");
        Ok(())
    }

    /// Stops the agent gracefully.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down sync agent");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(ref handle) = self.transport {
            let _ = handle.shutdown().await;
        }

        {
            let mut s = self.status.write().await;
            s.connection_state = ConnectionState::Disconnected;
            s.is_connected = false;
        }

        info!("Sync agent stopped");
        Ok(())
    }

    // =========================================================================
    // Edits
    // =========================================================================

    /// Replaces one table's line list, live when connected, queued when not.
    ///
    /// Either way the local cache is updated immediately so the UI shows
    /// the edit; the next `StateBroadcast` replaces it with whatever the
    /// hub durably wrote.
    pub async fn edit_table(
        &self,
        table_id: i64,
        session_id: SessionId,
        lines: Vec<OrderLine>,
    ) -> SyncResult<()> {
        {
            let mut orders = self.orders.write().await;
            if lines.is_empty() {
                orders.remove(&table_id);
            } else {
                orders.insert(
                    table_id,
                    ActiveOrder::new(table_id, session_id.clone(), lines.clone()),
                );
            }
        }

        if let Some(transport) = self.connected_transport() {
            let edit = ReplicaMessage::Edit(crate::protocol::EditPayload {
                table_id,
                session_id: session_id.clone(),
                lines: lines.clone(),
            });
            if transport.send(edit).await.is_ok() {
                return Ok(());
            }
            // Fall through: the transport dropped between the check and
            // the send; queue it like any offline edit.
        }

        debug!(table_id, "Offline, queueing table edit");
        self.queue
            .enqueue(MutationOp::UpsertActiveOrder {
                table_id,
                session_id,
                lines,
            })
            .await?;
        Ok(())
    }

    /// Queues an arbitrary mutation for replay.
    ///
    /// Non-order mutations (catalog, stock, finalize) always travel the
    /// queue-and-drain path so online and offline behave identically.
    pub async fn enqueue(&self, op: MutationOp) -> SyncResult<i64> {
        self.queue.enqueue(op).await
    }

    /// Drains the queue immediately instead of waiting for the next tick.
    pub async fn drain_now(&self) -> SyncResult<DrainOutcome> {
        self.queue.drain(self.remote.as_ref()).await
    }

    fn connected_transport(&self) -> Option<&TransportHandle> {
        self.transport.as_ref().filter(|t| t.is_connected())
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Applies incoming hub messages to the local cache.
    async fn message_router(
        orders: Arc<RwLock<HashMap<i64, ActiveOrder>>>,
        status: Arc<RwLock<SyncStatus>>,
        events: broadcast::Sender<AgentEvent>,
        mut incoming_rx: mpsc::Receiver<ReplicaMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = incoming_rx.recv() => {
                    Self::handle_incoming(&orders, &status, &events, msg).await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("Message router shutting down");
                    break;
                }
                else => break,
            }
        }
    }

    async fn handle_incoming(
        orders: &RwLock<HashMap<i64, ActiveOrder>>,
        status: &RwLock<SyncStatus>,
        events: &broadcast::Sender<AgentEvent>,
        msg: ReplicaMessage,
    ) {
        match msg {
            ReplicaMessage::StateBroadcast(payload) => {
                // Wholesale replacement: the hub's persisted set is the
                // truth, including tables we edited optimistically.
                let mut cache = orders.write().await;
                cache.clear();
                for order in payload.orders {
                    cache.insert(order.table_id, order);
                }
                drop(cache);
                let _ = events.send(AgentEvent::StateChanged);
            }

            ReplicaMessage::SaleFinalized(payload) => {
                info!(
                    sale_id = payload.sale_id,
                    table_id = payload.table_id,
                    "Sale finalized on hub"
                );
                let _ = events.send(AgentEvent::SaleFinalized {
                    sale_id: payload.sale_id,
                    table_id: payload.table_id,
                });
            }

            ReplicaMessage::Welcome(welcome) => {
                debug!(hub = %welcome.hub_device_id, "Handshake complete");
            }

            ReplicaMessage::Error { code, message } => {
                warn!(code = %code, message = %message, "Error from hub");
                let mut s = status.write().await;
                s.last_error = Some(format!("{code}: {message}"));
            }

            other => {
                debug!(kind = other.kind(), "Ignoring message kind");
            }
        }
    }

    /// Drains on reconnect and on a periodic tick while connected.
    async fn drain_loop(
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteApi>,
        status: Arc<RwLock<SyncStatus>>,
        transport: TransportHandle,
        interval: Duration,
    ) {
        let mut state_rx = transport.watch_state();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let trigger_drain = tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow();
                    {
                        let mut s = status.write().await;
                        s.connection_state = state;
                        s.is_connected = state == ConnectionState::Connected;
                    }
                    state == ConnectionState::Connected
                }
                _ = ticker.tick() => transport.is_connected(),
            };

            if !trigger_drain {
                continue;
            }

            match queue.drain(remote.as_ref()).await {
                Ok(DrainOutcome::Success { applied, skipped }) => {
                    if applied > 0 || skipped > 0 {
                        info!(applied, skipped, "Queue drained");
                    }
                    let mut s = status.write().await;
                    s.last_drain = Some(chrono::Utc::now().to_rfc3339());
                    s.last_error = None;
                }
                Ok(DrainOutcome::Blocked { entry, error, .. }) => {
                    let mut s = status.write().await;
                    s.last_error = Some(format!("entry {} ({}): {}", entry.id, entry.op.kind(), error));
                }
                Ok(DrainOutcome::AlreadyDraining) => {}
                Err(e) => {
                    warn!(%e, "Drain failed");
                    let mut s = status.write().await;
                    s.last_error = Some(e.to_string());
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
    use mesa_core::Money;
    use crate::protocol::{SaleFinalizedPayload, StatePayload};

    fn order(table_id: i64) -> ActiveOrder {
        ActiveOrder::new(
            table_id,
            SessionId::generate(),
            vec![OrderLine::new("1", "Espresso", Money::from_cents(250), 1)],
        )
    }

    #[tokio::test]
    async fn test_broadcast_replaces_cache_wholesale() {
        let orders = RwLock::new(HashMap::new());
        let status = RwLock::new(SyncStatus::default());
        let (events, mut rx) = broadcast::channel(8);

        // Pre-populate with a stale table the broadcast does not mention.
        orders.write().await.insert(9, order(9));

        SyncAgent::handle_incoming(
            &orders,
            &status,
            &events,
            ReplicaMessage::StateBroadcast(StatePayload {
                orders: vec![order(1), order(2)],
            }),
        )
        .await;

        let cache = orders.read().await;
        assert_eq!(cache.len(), 2);
        assert!(cache.contains_key(&1));
        assert!(cache.contains_key(&2));
        // Stale table 9 is gone: the cache converges to the persisted set.
        assert!(!cache.contains_key(&9));
        drop(cache);

        assert!(matches!(rx.recv().await.unwrap(), AgentEvent::StateChanged));
    }

    #[tokio::test]
    async fn test_sale_event_republished() {
        let orders = RwLock::new(HashMap::new());
        let status = RwLock::new(SyncStatus::default());
        let (events, mut rx) = broadcast::channel(8);

        SyncAgent::handle_incoming(
            &orders,
            &status,
            &events,
            ReplicaMessage::SaleFinalized(SaleFinalizedPayload {
                sale_id: 42,
                display_id: "S-0042".to_string(),
                table_id: 5,
                total: 1230,
            }),
        )
        .await;

        match rx.recv().await.unwrap() {
            AgentEvent::SaleFinalized { sale_id, table_id } => {
                assert_eq!(sale_id, 42);
                assert_eq!(table_id, 5);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hub_error_recorded_in_status() {
        let orders = RwLock::new(HashMap::new());
        let status = RwLock::new(SyncStatus::default());
        let (events, _rx) = broadcast::channel(8);

        SyncAgent::handle_incoming(
            &orders,
            &status,
            &events,
            ReplicaMessage::Error {
                code: "EDIT_REJECTED".to_string(),
                message: "too many lines".to_string(),
            },
        )
        .await;

        let s = status.read().await;
        assert_eq!(
            s.last_error.as_deref(),
            Some("EDIT_REJECTED: too many lines")
        );
    }
}
