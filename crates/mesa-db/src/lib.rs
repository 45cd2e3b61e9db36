//! # mesa-db: Storage Layer for Mesa POS
//!
//! SQLite-backed storage behind repository types. This crate owns every
//! transactional invariant of the system:
//!
//! - at most one active order per table, updated atomically
//! - exactly-once sale finalization, keyed by session id
//! - stock counters that always reconcile with the movement ledger
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          mesa-db                                        │
//! │                                                                         │
//! │  Database (pool.rs)                                                     │
//! │   ├── items()          → ItemRepository         catalog CRUD            │
//! │   ├── active_orders()  → ActiveOrderRepository  upsert/clear/transfer   │
//! │   ├── sales()          → SaleRepository         finalize, history       │
//! │   └── stock()          → StockRepository        supply/waste/history    │
//! │                                                                         │
//! │  migrations.rs  embedded SQL, run on startup                            │
//! │  error.rs       DbError + sqlx mapping                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let db = Database::new(DbConfig::new("./mesa.db")).await?;
//! db.active_orders().upsert(5, &session, &lines).await?;
//! let sale = db.sales().finalize(req).await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::active_order::ActiveOrderRepository;
pub use repository::item::{ItemRepository, NewMenuItem};
pub use repository::sale::{FinalizeSaleRequest, SaleRepository};
pub use repository::stock::{MovementTotals, StockHistory, StockRepository};
