//! # Repository Module
//!
//! Repository implementations for Mesa POS storage.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern Explained                         │
//! │                                                                         │
//! │  Request handler                                                        │
//! │       │                                                                 │
//! │       │  db.active_orders().upsert(table, session, lines)              │
//! │       │  ↓                                                              │
//! │       ▼                                                                 │
//! │  ActiveOrderRepository                                                  │
//! │  ├── upsert(&self, …)       atomic insert-or-update                    │
//! │  ├── clear(&self, table)                                               │
//! │  ├── transfer(&self, …)     one transaction over both tables           │
//! │  └── get_all(&self)         canonical state for broadcasting           │
//! │       │                                                                 │
//! │       │  SQL                                                            │
//! │       ▼                                                                 │
//! │  SQLite Database                                                        │
//! │                                                                         │
//! │  Benefits:                                                              │
//! │  • SQL is isolated in one place                                         │
//! │  • Transactional invariants live next to the queries they protect       │
//! │  • Handlers stay thin                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`item::ItemRepository`] - Catalog CRUD
//! - [`active_order::ActiveOrderRepository`] - Per-table in-progress orders
//! - [`sale::SaleRepository`] - Sale finalization and history
//! - [`stock::StockRepository`] - Stock ledger and costing

pub mod active_order;
pub mod item;
pub mod sale;
pub mod stock;
