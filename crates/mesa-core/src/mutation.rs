//! # Mutation Operations
//!
//! The closed union of every state-changing operation a client can queue
//! while offline and replay on reconnect.
//!
//! ## Why a Closed Union?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  STRING-TAGGED DISPATCH (rejected)        CLOSED SUM TYPE (this file)   │
//! │                                                                         │
//! │  match op.kind.as_str() {                 match op {                    │
//! │      "addItem" => …,                          MutationOp::UpsertItem…   │
//! │      "delItem" => …,                          MutationOp::DeleteItem…   │
//! │      _ => ???  ← silent drop                  // compiler enforces      │
//! │  }                                            // exhaustiveness         │
//! │                                           }                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! Adding a new mutation kind is a compile-time exhaustiveness requirement,
//! not a runtime surprise.
//!
//! ## Wire Format
//! Externally tagged as `{"op": "...", "payload": {...}}` so queue entries
//! stored before an upgrade still parse afterwards (unknown kinds fail
//! loudly at deserialization, not silently at dispatch).

use serde::{Deserialize, Serialize};

use crate::money::Money;
use crate::types::{OrderLine, SessionId};

// =============================================================================
// Mutation Operation Union
// =============================================================================

/// Every queueable state-changing operation.
///
/// Entries are durably stored client-side in insertion order and replayed
/// to the server FIFO; see the queue for the drain state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum MutationOp {
    /// Create or replace a catalog item.
    UpsertMenuItem {
        sku: String,
        name: String,
        price: Money,
        stock_group: Option<String>,
        track_stock: bool,
    },

    /// Remove a catalog item.
    DeleteMenuItem { item_id: i64 },

    /// Create or replace a category.
    UpsertCategory { name: String, sort_order: i64 },

    /// Remove a category.
    DeleteCategory { name: String },

    /// Create an operator account.
    AddUser { username: String, display_name: String },

    /// Remove an operator account.
    DeleteUser { username: String },

    /// Replace the item list of a table's active order.
    ///
    /// An empty `lines` list means "clear the table".
    UpsertActiveOrder {
        table_id: i64,
        session_id: SessionId,
        lines: Vec<OrderLine>,
    },

    /// Delete a table's active order outright.
    ClearActiveOrder { table_id: i64 },

    /// Move selected lines (or all lines) from one table to another.
    TransferOrder {
        from_table: i64,
        to_table: i64,
        /// Line ids to move; empty means the whole order.
        line_ids: Vec<String>,
    },

    /// Commit a table's order as a sale. Idempotent by session id.
    FinalizeSale {
        table_id: i64,
        session_id: SessionId,
        display_id: String,
        operator: String,
        lines: Vec<OrderLine>,
        tax: Money,
    },

    /// Record a goods delivery against an item.
    RecordSupply {
        item_id: i64,
        quantity: i64,
        total_cost: Money,
        reason: String,
        operator: String,
    },

    /// Record spoilage or breakage against an item.
    RecordWaste {
        item_id: i64,
        quantity: i64,
        reason: String,
        operator: String,
    },

    /// Set a device or venue setting (tax rate, receipt footer…).
    ///
    /// Remotes predating the settings API do not accept this kind; the
    /// queue treats that as a soft failure and discards the entry rather
    /// than blocking every mutation behind it.
    SetSetting { key: String, value: String },
}

impl MutationOp {
    /// Stable kind token, for logging and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            MutationOp::UpsertMenuItem { .. } => "upsert_menu_item",
            MutationOp::DeleteMenuItem { .. } => "delete_menu_item",
            MutationOp::UpsertCategory { .. } => "upsert_category",
            MutationOp::DeleteCategory { .. } => "delete_category",
            MutationOp::AddUser { .. } => "add_user",
            MutationOp::DeleteUser { .. } => "delete_user",
            MutationOp::UpsertActiveOrder { .. } => "upsert_active_order",
            MutationOp::ClearActiveOrder { .. } => "clear_active_order",
            MutationOp::TransferOrder { .. } => "transfer_order",
            MutationOp::FinalizeSale { .. } => "finalize_sale",
            MutationOp::RecordSupply { .. } => "record_supply",
            MutationOp::RecordWaste { .. } => "record_waste",
            MutationOp::SetSetting { .. } => "set_setting",
        }
    }

    /// True for operation kinds a remote may legitimately not support.
    ///
    /// These are discarded (with a log line) instead of blocking the
    /// queue when the remote rejects them as unknown.
    pub fn is_discardable(&self) -> bool {
        matches!(self, MutationOp::SetSetting { .. })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_externally_tagged() {
        let op = MutationOp::ClearActiveOrder { table_id: 7 };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"clear_active_order","payload":{"table_id":7}}"#);
    }

    #[test]
    fn test_roundtrip_finalize() {
        let op = MutationOp::FinalizeSale {
            table_id: 5,
            session_id: SessionId::new("abc"),
            display_id: "S-0042".to_string(),
            operator: "dana".to_string(),
            lines: vec![OrderLine::new("9", "Flat White", Money::from_cents(380), 2)],
            tax: Money::from_cents(76),
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: MutationOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_unknown_kind_fails_loudly() {
        let result: Result<MutationOp, _> =
            serde_json::from_str(r#"{"op":"warp_table","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_only_settings_are_discardable() {
        assert!(MutationOp::SetSetting {
            key: "tax_rate".to_string(),
            value: "0.19".to_string(),
        }
        .is_discardable());
        assert!(!MutationOp::ClearActiveOrder { table_id: 1 }.is_discardable());
    }

    #[test]
    fn test_kind_tokens() {
        let op = MutationOp::RecordWaste {
            item_id: 3,
            quantity: 2,
            reason: "dropped tray".to_string(),
            operator: "sam".to_string(),
        };
        assert_eq!(op.kind(), "record_waste");
    }
}
