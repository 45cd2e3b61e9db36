//! # Replication Protocol Messages
//!
//! Message types for the table-state replication channel.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Replication Protocol Messages                        │
//! │                                                                         │
//! │  HANDSHAKE FLOW                                                        │
//! │  ──────────────                                                        │
//! │  DEVICE ───► Hello { device_id, store_id, protocol_version }           │
//! │  HUB    ◄─── Welcome { hub_device_id, current leader }                 │
//! │                                                                         │
//! │  EDITS (persist-then-broadcast)                                        │
//! │  ──────────────────────────────                                        │
//! │  DEVICE ───► Edit { table_id, session_id, lines }   (one table scope)  │
//! │  HUB    ───► StateBroadcast { orders }   to ALL, after durable write   │
//! │                                                                         │
//! │  LEADER COMPAT PATH (bootstrap generation only)                        │
//! │  ──────────────────────────────────────────────                        │
//! │  DEVICE ───► AnnounceLeader { device_id }                              │
//! │  DEVICE ───► RequestState                                              │
//! │  LEADER ───► StateSnapshot { orders }    merged by table key           │
//! │                                                                         │
//! │  SALES                                                                 │
//! │  ─────                                                                 │
//! │  HUB    ───► SaleFinalized { sale_id, table_id, total }  (broadcast)   │
//! │                                                                         │
//! │  KEEPALIVE / ERROR                                                     │
//! │  Both   ◄──► Ping { timestamp } / Pong { ... }                         │
//! │  Both   ◄──► Error { code, message }                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Messages are serialized as adjacently tagged JSON:
//! ```json
//! { "type": "Edit", "payload": { "tableId": 5, ... } }
//! ```
//!
//! ## Ordering Guarantee
//! The hub always rebroadcasts the *persisted* state after an edit is
//! durably written, never a pre-write optimistic value. Clients converge
//! to the last value durably written, not the last value sent.

use serde::{Deserialize, Serialize};

use mesa_core::{ActiveOrder, OrderLine, SessionId};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All replication protocol messages.
///
/// Uses serde's adjacently tagged enum for clean JSON serialization:
/// `{ "type": "Hello", "payload": { ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ReplicaMessage {
    // =========================================================================
    // Handshake Messages
    // =========================================================================
    /// Initial connection message from a device.
    Hello(HelloPayload),

    /// Response from the hub after a successful handshake.
    Welcome(WelcomePayload),

    // =========================================================================
    // Order Replication
    // =========================================================================
    /// One-table edit from a device. The hub persists it and then
    /// broadcasts the canonical state.
    Edit(EditPayload),

    /// The full persisted active-order set, sent to every client after
    /// each durable mutation (and as the answer to `RequestState`).
    StateBroadcast(StatePayload),

    // =========================================================================
    // Leader Compat Path
    // =========================================================================
    /// A device claims the leader role (legacy protocol generation; the
    /// hub's own store is authoritative for current clients).
    AnnounceLeader { device_id: String },

    /// A client asks for the current state.
    RequestState { device_id: String },

    /// Full state pushed by the lease holder (compat path). Merged into
    /// the store by table key, never overwriting unrelated tables.
    StateSnapshot(StatePayload),

    // =========================================================================
    // Sale Events
    // =========================================================================
    /// A sale was committed; emitted only after the transaction commits.
    SaleFinalized(SaleFinalizedPayload),

    // =========================================================================
    // Keepalive Messages
    // =========================================================================
    /// Ping for keepalive.
    Ping { timestamp: String },

    /// Pong response for keepalive.
    Pong {
        ping_timestamp: String,
        pong_timestamp: String,
    },

    // =========================================================================
    // Error Messages
    // =========================================================================
    /// Error message.
    Error { code: String, message: String },
}

impl ReplicaMessage {
    /// Short kind token for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaMessage::Hello(_) => "Hello",
            ReplicaMessage::Welcome(_) => "Welcome",
            ReplicaMessage::Edit(_) => "Edit",
            ReplicaMessage::StateBroadcast(_) => "StateBroadcast",
            ReplicaMessage::AnnounceLeader { .. } => "AnnounceLeader",
            ReplicaMessage::RequestState { .. } => "RequestState",
            ReplicaMessage::StateSnapshot(_) => "StateSnapshot",
            ReplicaMessage::SaleFinalized(_) => "SaleFinalized",
            ReplicaMessage::Ping { .. } => "Ping",
            ReplicaMessage::Pong { .. } => "Pong",
            ReplicaMessage::Error { .. } => "Error",
        }
    }
}

// =============================================================================
// Handshake Payloads
// =============================================================================

/// Hello message sent by a device on connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Device identifier.
    pub device_id: String,

    /// Device name (human-readable).
    pub device_name: String,

    /// Store ID this device belongs to.
    pub store_id: String,

    /// Protocol version supported by this device.
    pub protocol_version: u32,

    /// Whether the device intends to announce leadership after the
    /// handshake (legacy clients only).
    #[serde(default)]
    pub announces_leader: bool,
}

impl HelloPayload {
    pub fn new(device_id: &str, device_name: &str, store_id: &str) -> Self {
        HelloPayload {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            store_id: store_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
            announces_leader: false,
        }
    }
}

/// Welcome message sent by the hub after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    /// Hub device ID.
    pub hub_device_id: String,

    /// Store ID confirmed by the hub.
    pub store_id: String,

    /// Device id of the current lease holder, if any (compat path).
    pub leader_device_id: Option<String>,

    /// Server timestamp (RFC 3339).
    pub server_time: String,
}

// =============================================================================
// Order Payloads
// =============================================================================

/// A one-table edit.
///
/// Carries the table's complete line list (edits replace wholesale);
/// an empty list clears the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPayload {
    pub table_id: i64,
    pub session_id: SessionId,
    pub lines: Vec<OrderLine>,
}

/// The full active-order set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub orders: Vec<ActiveOrder>,
}

/// Broadcast after a sale commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleFinalizedPayload {
    pub sale_id: i64,
    pub display_id: String,
    pub table_id: i64,
    /// Total in cents.
    pub total: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_core::Money;

    #[test]
    fn test_adjacent_tagging() {
        let msg = ReplicaMessage::RequestState {
            device_id: "dev-1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"RequestState","payload":{"device_id":"dev-1"}}"#
        );
    }

    #[test]
    fn test_edit_roundtrip() {
        let msg = ReplicaMessage::Edit(EditPayload {
            table_id: 5,
            session_id: SessionId::new("abc"),
            lines: vec![OrderLine::new("9", "Flat White", Money::from_cents(380), 1)],
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"Edit""#));
        assert!(json.contains(r#""tableId":5"#));

        let back: ReplicaMessage = serde_json::from_str(&json).unwrap();
        match back {
            ReplicaMessage::Edit(payload) => {
                assert_eq!(payload.table_id, 5);
                assert_eq!(payload.lines.len(), 1);
            }
            other => panic!("wrong message kind: {}", other.kind()),
        }
    }

    #[test]
    fn test_hello_defaults_to_non_leader() {
        let json = r#"{"type":"Hello","payload":{
            "deviceId":"d","deviceName":"n","storeId":"s","protocolVersion":2}}"#;
        let msg: ReplicaMessage = serde_json::from_str(json).unwrap();
        match msg {
            ReplicaMessage::Hello(h) => assert!(!h.announces_leader),
            other => panic!("wrong message kind: {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type":"WarpTable","payload":{}}"#;
        assert!(serde_json::from_str::<ReplicaMessage>(json).is_err());
    }
}
