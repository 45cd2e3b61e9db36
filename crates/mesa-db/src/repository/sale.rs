//! # Sale Repository
//!
//! Sale finalization and history.
//!
//! ## The Finalization Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Finalize (one atomic unit of work)                      │
//! │                                                                         │
//! │  BEGIN                                                                  │
//! │   1. session already paid?  ──yes──► ROLLBACK, AlreadyPaid              │
//! │   2. INSERT sale header                                                 │
//! │   3. DELETE active order (superseded)                                   │
//! │   4. per line:                                                          │
//! │        • product id genuine and in catalog? ──no──► ROLLBACK            │
//! │        • INSERT sale line snapshot                                      │
//! │        • tracked stock: group counter −qty, INSERT sale movement        │
//! │  COMMIT                                                                 │
//! │   5. only now: caller rebroadcasts state and announces the sale         │
//! │                                                                         │
//! │  A retry with the same session id hits step 1 (or, if two requests      │
//! │  race past it, the UNIQUE index on sales.session_id) and the original   │
//! │  sale stands. No duplicate header ⇒ no duplicate stock decrement.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sale rows are immutable and line items are snapshots; catalog edits
//! after the fact can never alter a committed sale.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::stock;
use mesa_core::validation::{parse_product_id, validate_line};
use mesa_core::{CoreError, Money, MovementKind, OrderLine, Sale, SaleLine, SessionId};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct SaleRow {
    id: i64,
    display_id: String,
    session_id: Option<String>,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    operator: String,
    table_id: i64,
    created_at: DateTime<Utc>,
}

impl From<SaleRow> for Sale {
    fn from(row: SaleRow) -> Self {
        Sale {
            id: row.id,
            display_id: row.display_id,
            session_id: row.session_id.map(SessionId::new),
            subtotal: Money::from_cents(row.subtotal_cents),
            tax: Money::from_cents(row.tax_cents),
            total: Money::from_cents(row.total_cents),
            operator: row.operator,
            table_id: row.table_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SaleLineRow {
    id: i64,
    sale_id: i64,
    product_id: i64,
    name: String,
    unit_price_cents: i64,
    quantity: i64,
}

impl From<SaleLineRow> for SaleLine {
    fn from(row: SaleLineRow) -> Self {
        SaleLine {
            id: row.id,
            sale_id: row.sale_id,
            product_id: row.product_id,
            name: row.name,
            unit_price: Money::from_cents(row.unit_price_cents),
            quantity: row.quantity,
        }
    }
}

const SELECT_SALE: &str = "\
    SELECT id, display_id, session_id, subtotal_cents, tax_cents, total_cents, \
           operator, table_id, created_at \
    FROM sales";

// =============================================================================
// Finalize Request
// =============================================================================

/// Everything the finalization transaction needs from the caller.
#[derive(Debug, Clone)]
pub struct FinalizeSaleRequest {
    pub table_id: i64,
    /// Idempotency key. Placeholder sessions are stored as NULL (no
    /// idempotency guarantee for legacy clients that never synced one).
    pub session_id: SessionId,
    /// Client-generated ticket number.
    pub display_id: String,
    pub operator: String,
    pub lines: Vec<OrderLine>,
    pub tax: Money,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for sale operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// Commits an order as a sale, exactly once.
    ///
    /// See the module docs for the transaction shape. On any failure the
    /// whole transaction rolls back and the table's active order remains
    /// untouched; the error names the offending line where there is one.
    pub async fn finalize(&self, req: FinalizeSaleRequest) -> DbResult<Sale> {
        if req.lines.is_empty() {
            return Err(DbError::Domain(
                mesa_core::ValidationError::NoItemsSelected.into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        // 1. Idempotency check. The UNIQUE index on session_id backs this
        //    up if two finalize requests race past the SELECT.
        let stored_session = if req.session_id.is_placeholder() {
            None
        } else {
            Some(req.session_id.as_str())
        };
        if let Some(session) = stored_session {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM sales WHERE session_id = ?1")
                    .bind(session)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some((sale_id,)) = existing {
                debug!(session, sale_id, "Duplicate finalize rejected");
                return Err(DbError::AlreadyPaid {
                    session_id: session.to_string(),
                    sale_id,
                });
            }
        }

        let subtotal = req
            .lines
            .iter()
            .fold(Money::zero(), |acc, l| acc + l.line_total());
        let total = subtotal + req.tax;
        let now = Utc::now();

        // 2. Sale header.
        let result = sqlx::query(
            r#"
            INSERT INTO sales (display_id, session_id, subtotal_cents, tax_cents,
                               total_cents, operator, table_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&req.display_id)
        .bind(stored_session)
        .bind(subtotal.cents())
        .bind(req.tax.cents())
        .bind(total.cents())
        .bind(&req.operator)
        .bind(req.table_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let sale_id = result.last_insert_rowid();

        // 3. The active order is superseded by the sale.
        sqlx::query("DELETE FROM active_orders WHERE table_id = ?1")
            .bind(req.table_id)
            .execute(&mut *tx)
            .await?;

        // 4. Line snapshots and stock consumption.
        for line in &req.lines {
            validate_line(line)?;
            let product_id = parse_product_id(&line.product_id).map_err(|_| {
                DbError::Domain(CoreError::InvalidLineItem {
                    line_id: line.line_id.clone(),
                    reason: format!("'{}' is not a valid product id", line.product_id),
                })
            })?;

            let item = stock::get_item_on(&mut tx, product_id)
                .await
                .map_err(|e| match e {
                    DbError::Domain(CoreError::ItemNotFound(_)) => {
                        DbError::Domain(CoreError::InvalidLineItem {
                            line_id: line.line_id.clone(),
                            reason: format!("product {product_id} no longer exists"),
                        })
                    }
                    other => other,
                })?;

            sqlx::query(
                r#"
                INSERT INTO sale_lines (sale_id, product_id, name, unit_price_cents, quantity)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(sale_id)
            .bind(product_id)
            .bind(&line.name)
            .bind(line.unit_price.cents())
            .bind(line.quantity)
            .execute(&mut *tx)
            .await?;

            if item.track_stock {
                stock::adjust_stock(&mut tx, &item, -line.quantity, None).await?;
                stock::insert_movement(
                    &mut tx,
                    product_id,
                    -line.quantity,
                    MovementKind::Sale,
                    &format!("sale {}", req.display_id),
                    &req.operator,
                    None,
                )
                .await?;
            }
        }

        // 5. Commit; broadcasting is the caller's job, after this returns.
        tx.commit().await?;

        info!(
            sale_id,
            display_id = %req.display_id,
            table_id = req.table_id,
            total = total.cents(),
            "Sale finalized"
        );

        self.get_by_id(sale_id)
            .await?
            .ok_or_else(|| DbError::Internal("finalized sale vanished".to_string()))
    }

    /// Gets a sale by server id.
    pub async fn get_by_id(&self, id: i64) -> DbResult<Option<Sale>> {
        let row: Option<SaleRow> = sqlx::query_as(&format!("{SELECT_SALE} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Sale::from))
    }

    /// Gets a sale by its session id.
    pub async fn get_by_session(&self, session_id: &SessionId) -> DbResult<Option<Sale>> {
        let row: Option<SaleRow> =
            sqlx::query_as(&format!("{SELECT_SALE} WHERE session_id = ?1"))
                .bind(session_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Sale::from))
    }

    /// Line snapshots of a sale, in insertion order.
    pub async fn lines(&self, sale_id: i64) -> DbResult<Vec<SaleLine>> {
        let rows: Vec<SaleLineRow> = sqlx::query_as(
            "SELECT id, sale_id, product_id, name, unit_price_cents, quantity \
             FROM sale_lines WHERE sale_id = ?1 ORDER BY id",
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SaleLine::from).collect())
    }

    /// Most recent sales, newest first.
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<Sale>> {
        let rows: Vec<SaleRow> =
            sqlx::query_as(&format!("{SELECT_SALE} ORDER BY id DESC LIMIT ?1"))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Sale::from).collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::repository::item::NewMenuItem;
    use mesa_core::MenuItem;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    async fn seed_item(db: &Database, sku: &str, group: Option<&str>) -> MenuItem {
        let item = db
            .items()
            .insert(NewMenuItem {
                sku: sku.to_string(),
                name: format!("Item {sku}"),
                price: Money::from_cents(400),
                stock_group: group.map(str::to_string),
                track_stock: true,
                low_stock_threshold: 5,
            })
            .await
            .unwrap();
        db.stock()
            .receive_supply(item.id, 50, Money::from_cents(5000), "seed", "dana")
            .await
            .unwrap()
    }

    fn request(item: &MenuItem, qty: i64, session: SessionId) -> FinalizeSaleRequest {
        FinalizeSaleRequest {
            table_id: 5,
            session_id: session,
            display_id: "S-0001".to_string(),
            operator: "dana".to_string(),
            lines: vec![OrderLine::new(
                item.id.to_string(),
                &item.name,
                item.price,
                qty,
            )],
            tax: Money::from_cents(40),
        }
    }

    #[tokio::test]
    async fn test_finalize_happy_path() {
        let db = test_db().await;
        let item = seed_item(&db, "ESP", None).await;
        let session = SessionId::generate();

        db.active_orders()
            .upsert(
                5,
                &session,
                &[OrderLine::new(item.id.to_string(), &item.name, item.price, 2)],
            )
            .await
            .unwrap();

        let sale = db.sales().finalize(request(&item, 2, session)).await.unwrap();

        assert_eq!(sale.subtotal.cents(), 800);
        assert_eq!(sale.total.cents(), 840);
        assert_eq!(sale.table_id, 5);

        // Active order superseded, stock consumed, snapshot written.
        assert!(db.active_orders().get(5).await.unwrap().is_none());
        let item = db.items().get_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(item.stock_qty, 48);

        let lines = db.sales().lines(sale.id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 2);
        assert_eq!(lines[0].product_id, item.id);
    }

    #[tokio::test]
    async fn test_replayed_finalize_does_not_duplicate() {
        let db = test_db().await;
        let item = seed_item(&db, "ESP", None).await;
        let session = SessionId::generate();

        let sale = db
            .sales()
            .finalize(request(&item, 1, session.clone()))
            .await
            .unwrap();

        // A queue retry replays the identical request.
        let err = db
            .sales()
            .finalize(request(&item, 1, session.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyPaid { sale_id, .. } if sale_id == sale.id));

        // One sale, one stock decrement.
        assert_eq!(db.sales().recent(10).await.unwrap().len(), 1);
        let item = db.items().get_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(item.stock_qty, 49);
        assert_eq!(
            db.sales().get_by_session(&session).await.unwrap().unwrap().id,
            sale.id
        );
    }

    #[tokio::test]
    async fn test_bad_line_rolls_back_everything() {
        let db = test_db().await;
        let item = seed_item(&db, "ESP", None).await;
        let session = SessionId::generate();

        db.active_orders()
            .upsert(
                5,
                &session,
                &[OrderLine::new(item.id.to_string(), &item.name, item.price, 1)],
            )
            .await
            .unwrap();

        let mut req = request(&item, 1, session);
        req.lines
            .push(OrderLine::new("temp-99", "Ghost Dish", Money::from_cents(100), 1));

        let err = db.sales().finalize(req).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Domain(CoreError::InvalidLineItem { .. })
        ));

        // Nothing committed: no sale, order intact, stock untouched.
        assert!(db.sales().recent(10).await.unwrap().is_empty());
        assert!(db.active_orders().get(5).await.unwrap().is_some());
        let item = db.items().get_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(item.stock_qty, 50);
        assert!(db.stock().history(item.id).await.unwrap().totals.sold == 0);
    }

    #[tokio::test]
    async fn test_deleted_product_aborts_sale() {
        let db = test_db().await;
        let item = seed_item(&db, "ESP", None).await;

        let mut req = request(&item, 1, SessionId::generate());
        req.lines = vec![OrderLine::new("424242", "Gone", Money::from_cents(100), 1)];

        let err = db.sales().finalize(req).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Domain(CoreError::InvalidLineItem { .. })
        ));
    }

    #[tokio::test]
    async fn test_sale_decrements_whole_stock_group() {
        let db = test_db().await;
        let pint = seed_item(&db, "PINT", Some("keg")).await;
        let half = db
            .items()
            .insert(NewMenuItem {
                sku: "HALF".to_string(),
                name: "Half Pint".to_string(),
                price: Money::from_cents(250),
                stock_group: Some("keg".to_string()),
                track_stock: true,
                low_stock_threshold: 5,
            })
            .await
            .unwrap();

        db.sales()
            .finalize(request(&pint, 3, SessionId::generate()))
            .await
            .unwrap();

        let half = db.items().get_by_id(half.id).await.unwrap().unwrap();
        assert_eq!(half.stock_qty, 47);
    }

    #[tokio::test]
    async fn test_placeholder_session_stored_as_null() {
        let db = test_db().await;
        let item = seed_item(&db, "ESP", None).await;

        let sale = db
            .sales()
            .finalize(request(&item, 1, SessionId::placeholder()))
            .await
            .unwrap();
        assert!(sale.session_id.is_none());

        // A second placeholder sale is a distinct sale, not a duplicate
        // (no idempotency key ⇒ no idempotency guarantee).
        db.sales()
            .finalize(request(&item, 1, SessionId::placeholder()))
            .await
            .unwrap();
        assert_eq!(db.sales().recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_survives_catalog_edit() {
        let db = test_db().await;
        let item = seed_item(&db, "ESP", None).await;

        let sale = db
            .sales()
            .finalize(request(&item, 1, SessionId::generate()))
            .await
            .unwrap();

        db.items()
            .update_details(item.id, "Renamed", Money::from_cents(999), 1)
            .await
            .unwrap();

        let lines = db.sales().lines(sale.id).await.unwrap();
        assert_eq!(lines[0].name, "Item ESP");
        assert_eq!(lines[0].unit_price.cents(), 400);
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let db = test_db().await;
        let req = FinalizeSaleRequest {
            table_id: 1,
            session_id: SessionId::generate(),
            display_id: "S-0002".to_string(),
            operator: "dana".to_string(),
            lines: vec![],
            tax: Money::zero(),
        };
        assert!(db.sales().finalize(req).await.is_err());
    }
}
