//! # Domain Types
//!
//! Core domain types used throughout Mesa POS.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐        │
//! │  │  ActiveOrder    │   │      Sale       │   │   MenuItem      │        │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │        │
//! │  │  table_id       │──►│  id (server)    │   │  id (i64)       │        │
//! │  │  session_id     │   │  display_id     │   │  sku / name     │        │
//! │  │  lines          │   │  session_id     │   │  stock_group    │        │
//! │  │  (one per table)│   │  totals (cents) │   │  stock_qty      │        │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘        │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                              │
//! │  │   OrderLine     │   │ StockMovement   │                              │
//! │  │  line_id (uuid) │   │  signed delta   │                              │
//! │  │  product_id     │   │  kind/reason    │                              │
//! │  │  qty / price    │   │  append-only    │                              │
//! │  └─────────────────┘   └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Pattern
//! - Active orders are keyed by **table id** (at most one per table).
//! - Sales carry a **client display id** plus a **server sequential id**;
//!   the **session id** ties a Sale back to the ActiveOrder it came from
//!   and is the idempotency key for finalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;
use crate::PLACEHOLDER_PREFIX;

// =============================================================================
// Session Identifier
// =============================================================================

/// Opaque token generated when a table's order is opened.
///
/// ## Why It Exists
/// ```text
/// Open order (table 5)            Finalize (retry after timeout)
///      │                                │
///      ▼                                ▼
/// session = "1a2b…"  ──────────►  sales.session_id UNIQUE
///                                        │
///                                        ▼
///                            duplicate session ⇒ "already paid"
/// ```
/// Offline clients mint `temp-…` placeholders before they have a real
/// session; a placeholder must never overwrite a genuine stored session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh session id (UUID v4).
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Mints a client-local placeholder for use before the order is synced.
    pub fn placeholder() -> Self {
        SessionId(format!("{}{}", PLACEHOLDER_PREFIX, Uuid::new_v4()))
    }

    /// Wraps an existing token.
    pub fn new(token: impl Into<String>) -> Self {
        SessionId(token.into())
    }

    /// True for tokens that must never displace a stored session id:
    /// the empty string and `temp-…` offline placeholders.
    pub fn is_placeholder(&self) -> bool {
        self.0.is_empty() || self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Order Line
// =============================================================================

/// One line of a table's in-progress order.
///
/// The `line_id` is unique per line (not per product): two separate orders
/// of the same dish stay distinguishable, which is what makes partial
/// transfers and per-line history possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    /// Per-line unique id (UUID v4).
    pub line_id: String,

    /// Product reference. Kept as a string because offline clients may
    /// carry `temp-…` placeholders until the catalog syncs; finalization
    /// re-validates it as a genuine numeric id.
    pub product_id: String,

    /// Display name at the time the line was added.
    pub name: String,

    /// Unit price in cents.
    pub unit_price: Money,

    /// Quantity ordered.
    pub quantity: i64,
}

impl OrderLine {
    /// Creates a line with a fresh line id.
    pub fn new(product_id: impl Into<String>, name: impl Into<String>, unit_price: Money, quantity: i64) -> Self {
        OrderLine {
            line_id: Uuid::new_v4().to_string(),
            product_id: product_id.into(),
            name: name.into(),
            unit_price,
            quantity,
        }
    }

    /// Line total (unit price × quantity).
    #[inline]
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply_quantity(self.quantity)
    }
}

// =============================================================================
// Active Order
// =============================================================================

/// Status of an active order. Only `Open` exists today; finalized orders
/// are deleted, not transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Open,
}

/// The live, uncommitted item list for one table.
///
/// ## Invariants
/// - At most one active order per `table_id`.
/// - An active order with zero lines is deleted, never retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOrder {
    /// Table this order belongs to (unique key).
    pub table_id: i64,

    /// Session token tying this order to the Sale it will become.
    pub session_id: SessionId,

    /// Ordered line list.
    pub lines: Vec<OrderLine>,

    /// Order status.
    #[serde(default)]
    pub status: OrderStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveOrder {
    /// Creates an open order stamped with the current time.
    pub fn new(table_id: i64, session_id: SessionId, lines: Vec<OrderLine>) -> Self {
        let now = Utc::now();
        ActiveOrder {
            table_id,
            session_id,
            lines,
            status: OrderStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of all line totals.
    pub fn subtotal(&self) -> Money {
        self.lines
            .iter()
            .fold(Money::zero(), |acc, l| acc + l.line_total())
    }

    /// True when the order holds no lines (and must be deleted).
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// =============================================================================
// Sale
// =============================================================================

/// An immutable, committed sale.
///
/// Created only by the finalization transaction; never mutated, never
/// deleted. Line items are snapshots so later catalog edits can never
/// alter a historical sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    /// Server-assigned sequential id.
    pub id: i64,

    /// Client-generated display id (shown on tickets).
    pub display_id: String,

    /// Session id of the active order this sale was created from.
    /// `None` for legacy/direct sales; unique when present.
    pub session_id: Option<SessionId>,

    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,

    /// Operator who finalized the sale.
    pub operator: String,

    /// Table the order was served at.
    pub table_id: i64,

    pub created_at: DateTime<Utc>,
}

/// A snapshot line of a committed sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    /// Server-assigned line id.
    pub id: i64,

    /// Sale this line belongs to.
    pub sale_id: i64,

    /// Genuine (numeric) product id, validated at finalization.
    pub product_id: i64,

    /// Product name at the time of sale (frozen).
    pub name: String,

    /// Unit price at the time of sale (frozen).
    pub unit_price: Money,

    pub quantity: i64,
}

// =============================================================================
// Menu Item
// =============================================================================

/// A catalog item.
///
/// ## Stock Groups
/// Items sharing a `stock_group` key share one physical stock counter,
/// one threshold and one tracking flag — a draught beer sold as pint and
/// half-pint is still one keg. Every stock-affecting operation on a
/// member propagates to the whole group in the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub price: Money,

    /// Shared-stock key; `None` means the item stands alone.
    pub stock_group: Option<String>,

    /// Whether stock is tracked for this item at all.
    pub track_stock: bool,

    /// Materialized stock counter (units), kept in step with the
    /// movement ledger inside every stock-affecting transaction.
    pub stock_qty: i64,

    /// Weighted-average unit cost in cents.
    pub avg_cost: Money,

    /// Low-stock warning threshold.
    pub low_stock_threshold: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Stock Movement
// =============================================================================

/// Movement kinds in the append-only stock ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    /// Goods received; carries the batch unit cost.
    Supply,
    /// Consumption by a committed sale (written only by finalization).
    Sale,
    /// Spoilage, breakage, comps.
    Waste,
    /// Manual counter correction.
    Correction,
}

impl MovementKind {
    /// Stable storage token.
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Supply => "supply",
            MovementKind::Sale => "sale",
            MovementKind::Waste => "waste",
            MovementKind::Correction => "correction",
        }
    }

    /// Parses a storage token.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "supply" => Some(MovementKind::Supply),
            "sale" => Some(MovementKind::Sale),
            "waste" => Some(MovementKind::Waste),
            "correction" => Some(MovementKind::Correction),
            _ => None,
        }
    }
}

/// One append-only ledger entry.
///
/// ## Invariant
/// The sum of movements for an item (or its whole stock group) reconciles
/// with the materialized `stock_qty` counter; both are written in the same
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: i64,
    pub item_id: i64,

    /// Signed quantity delta (negative for sale/waste).
    pub quantity: i64,

    pub kind: MovementKind,

    /// Free-text reason ("weekly delivery", "dropped tray"…).
    pub reason: String,

    /// Operator who triggered the movement.
    pub operator: String,

    /// For `supply` movements: the batch's own unit cost (not the
    /// blended average).
    pub unit_cost: Option<Money>,

    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_placeholder_detection() {
        assert!(SessionId::new("").is_placeholder());
        assert!(SessionId::placeholder().is_placeholder());
        assert!(!SessionId::generate().is_placeholder());
        assert!(!SessionId::new("1a2b3c").is_placeholder());
    }

    #[test]
    fn test_order_line_total() {
        let line = OrderLine::new("42", "Espresso", Money::from_cents(250), 3);
        assert_eq!(line.line_total().cents(), 750);
    }

    #[test]
    fn test_active_order_subtotal() {
        let order = ActiveOrder {
            table_id: 5,
            session_id: SessionId::generate(),
            lines: vec![
                OrderLine::new("1", "Soup", Money::from_cents(600), 2),
                OrderLine::new("2", "Bread", Money::from_cents(150), 1),
            ],
            status: OrderStatus::Open,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(order.subtotal().cents(), 1350);
        assert!(!order.is_empty());
    }

    #[test]
    fn test_movement_kind_tokens() {
        for kind in [
            MovementKind::Supply,
            MovementKind::Sale,
            MovementKind::Waste,
            MovementKind::Correction,
        ] {
            assert_eq!(MovementKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MovementKind::parse("refund"), None);
    }

    #[test]
    fn test_order_line_serde_camel_case() {
        let line = OrderLine::new("42", "Espresso", Money::from_cents(250), 1);
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains("\"lineId\""));
        assert!(json.contains("\"productId\""));
        assert!(json.contains("\"unitPrice\":250"));
    }
}
