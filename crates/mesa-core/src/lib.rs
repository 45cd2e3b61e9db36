//! # mesa-core: Pure Business Logic for Mesa POS
//!
//! The foundation crate of Mesa POS: every rule that can be expressed as a
//! pure function lives here, with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Mesa POS Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     mesa-sync (replication)                     │   │
//! │  │    Hub server ── leader lease ── mutation queue ── transport    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                     mesa-db (storage)                           │   │
//! │  │    Active orders ── sale finalization ── stock ledger           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                ★ mesa-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐   │   │
//! │  │   │   types   │  │   money   │  │  costing  │  │ mutation  │   │   │
//! │  │   │ OrderLine │  │   Money   │  │ wtd. avg  │  │MutationOp │   │   │
//! │  │   │   Sale    │  │  (cents)  │  │ unit cost │  │  (union)  │   │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (ActiveOrder, Sale, MenuItem, StockMovement…)
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`mutation`] - The closed union of queueable mutations
//! - [`costing`] - Weighted-average cost math
//! - [`error`] - Domain error types
//! - [`validation`] - Business rule validation
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: same input = same output, always
//! 2. **Integer Money**: all monetary values are cents (i64)
//! 3. **Explicit Errors**: errors are typed enum variants, never strings

// =============================================================================
// Module Declarations
// =============================================================================

pub mod costing;
pub mod error;
pub mod money;
pub mod mutation;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use mutation::MutationOp;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum distinct lines allowed on one table's active order.
///
/// ## Why
/// Prevents runaway orders from an editing loop on a misbehaving client.
pub const MAX_ORDER_LINES: usize = 200;

/// Maximum quantity of a single line.
///
/// Guards against fat-finger entry (1000 instead of 10).
pub const MAX_LINE_QUANTITY: i64 = 999;

/// Prefix used by offline clients for identifiers they mint before the
/// server has assigned a real one. A product or session id carrying this
/// prefix must never reach a committed Sale.
pub const PLACEHOLDER_PREFIX: &str = "temp-";
