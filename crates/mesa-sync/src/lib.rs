//! # mesa-sync: Replication Layer for Mesa POS
//!
//! Multi-device order replication: every device sees every table's live
//! order, edits survive offline periods, and the hub's store is the
//! single source of truth.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Replication Architecture                           │
//! │                                                                         │
//! │   DEVICE (client)                          HUB (server)                 │
//! │  ┌───────────────────────────┐   ws    ┌──────────────────────────────┐│
//! │  │ SyncAgent                 │◄───────►│ HubServer (axum)             ││
//! │  │  ├─ Transport (reconnect) │         │  ├─ /ws   handshake + fanout ││
//! │  │  ├─ MutationQueue (FIFO)  │  http   │  ├─ /api  queue replay       ││
//! │  │  │    └─ HttpRemote ──────┼────────►│  │        surface            ││
//! │  │  └─ order cache           │         │  ├─ LeaderLease (compat)     ││
//! │  └───────────────────────────┘         │  └─ Active-Order Store       ││
//! │                                        │       (mesa-db, SQLite)      ││
//! │                                        └──────────────────────────────┘│
//! │                                                                         │
//! │  INVARIANTS:                                                           │
//! │  • Persist-then-broadcast: clients converge to the last durably        │
//! │    written value, never to the last value sent.                        │
//! │  • The queue delivers at-least-once, in order; idempotency lives       │
//! │    server-side (session-id dedup in sale finalization).                │
//! │  • Leadership is a compat concept for older clients; the hub's own     │
//! │    store is authoritative.                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Device-side `SyncAgent` orchestrator
//! - [`api`] - Hub HTTP routes, the queue's replay surface
//! - [`config`] - Device/store/hub configuration (TOML + env)
//! - [`error`] - Sync error types
//! - [`hub`] - WebSocket hub server
//! - [`leader`] - Compat-path leader lease
//! - [`protocol`] - Wire messages
//! - [`queue`] - Durable mutation queue
//! - [`remote`] - `RemoteApi` trait and `HttpRemote`
//! - [`transport`] - WebSocket client with reconnection

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod leader;
pub mod protocol;
pub mod queue;
pub mod remote;
pub mod transport;

pub use agent::{AgentEvent, SyncAgent, SyncStatus};
pub use config::{FormFactor, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use hub::{HubHandle, HubServer};
pub use leader::{LeaderInfo, LeaderLease};
pub use protocol::{ReplicaMessage, PROTOCOL_VERSION};
pub use queue::{DrainOutcome, MutationQueue, QueueEntry, QueueStore, SqliteQueueStore};
pub use remote::{FinalizePayload, HttpRemote, RemoteApi};
pub use transport::{ConnectionState, Transport, TransportConfig, TransportHandle};
