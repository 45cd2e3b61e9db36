//! # Stock Ledger Repository
//!
//! The append-only movement ledger and the costing writes that go with it.
//!
//! ## The Two-Write Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Every stock-affecting operation makes exactly two writes,              │
//! │  in ONE transaction:                                                    │
//! │                                                                         │
//! │    1. UPDATE menu_items   (materialized counter, maybe avg cost)        │
//! │       … WHERE stock_group = ?     ← the whole group, one statement      │
//! │    2. INSERT stock_movements      (the auditable ledger entry)          │
//! │                                                                         │
//! │  The counter is materialized, not derived; the transaction boundary     │
//! │  is what keeps it reconcilable with the ledger sum.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stock Groups
//! A pint and a half-pint of the same keg are two catalog rows over one
//! inventory. The counter update targets `stock_group = ?` in a single
//! statement, so group members can never observe different counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::item::{ItemRow, SELECT_ITEM};
use mesa_core::costing::{batch_unit_cost, weighted_average_cost};
use mesa_core::{CoreError, MenuItem, Money, MovementKind, StockMovement, ValidationError};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct MovementRow {
    id: i64,
    item_id: i64,
    quantity: i64,
    kind: String,
    reason: String,
    operator: String,
    unit_cost_cents: Option<i64>,
    created_at: DateTime<Utc>,
}

impl MovementRow {
    fn into_movement(self) -> DbResult<StockMovement> {
        let kind = MovementKind::parse(&self.kind).ok_or_else(|| DbError::CorruptData {
            entity: "stock movement".to_string(),
            id: self.id.to_string(),
            reason: format!("unknown kind '{}'", self.kind),
        })?;
        Ok(StockMovement {
            id: self.id,
            item_id: self.item_id,
            quantity: self.quantity,
            kind,
            reason: self.reason,
            operator: self.operator,
            unit_cost: self.unit_cost_cents.map(Money::from_cents),
            created_at: self.created_at,
        })
    }
}

// =============================================================================
// History
// =============================================================================

/// Per-kind quantity totals over a history window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementTotals {
    pub supplied: i64,
    pub sold: i64,
    pub wasted: i64,
    pub corrected: i64,
}

/// The full inventory story of an item.
///
/// When the item belongs to a stock group, movements of every member are
/// included; grouped items share one inventory from the operator's point
/// of view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockHistory {
    pub item_id: i64,
    pub stock_group: Option<String>,
    pub totals: MovementTotals,
    /// Newest first.
    pub movements: Vec<StockMovement>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for stock ledger operations.
#[derive(Debug, Clone)]
pub struct StockRepository {
    pool: SqlitePool,
}

impl StockRepository {
    /// Creates a new StockRepository.
    pub fn new(pool: SqlitePool) -> Self {
        StockRepository { pool }
    }

    /// Records a goods delivery.
    ///
    /// Computes the batch unit cost and the new weighted-average cost,
    /// updates counter and average for the whole stock group, and appends
    /// one `supply` movement carrying the batch's own unit cost (not the
    /// blended average), all in one transaction.
    pub async fn receive_supply(
        &self,
        item_id: i64,
        quantity: i64,
        total_cost: Money,
        reason: &str,
        operator: &str,
    ) -> DbResult<MenuItem> {
        let batch_cost = batch_unit_cost(total_cost, quantity).ok_or_else(|| {
            DbError::Domain(
                ValidationError::MustBePositive {
                    field: "quantity".to_string(),
                }
                .into(),
            )
        })?;

        let mut tx = self.pool.begin().await?;

        let item = get_item_on(&mut tx, item_id).await?;
        let new_avg =
            weighted_average_cost(item.stock_qty, item.avg_cost, quantity, total_cost)
                .ok_or_else(|| DbError::Internal("average cost computation failed".to_string()))?;

        debug!(
            item_id,
            quantity,
            batch_cost = batch_cost.cents(),
            new_avg = new_avg.cents(),
            "Receiving supply"
        );

        adjust_stock(&mut tx, &item, quantity, Some(new_avg)).await?;
        insert_movement(
            &mut tx,
            item_id,
            quantity,
            MovementKind::Supply,
            reason,
            operator,
            Some(batch_cost),
        )
        .await?;

        tx.commit().await?;

        self.pool_item(item_id).await
    }

    /// Records spoilage or breakage as a negative `waste` movement,
    /// decrementing the group counter.
    pub async fn record_waste(
        &self,
        item_id: i64,
        quantity: i64,
        reason: &str,
        operator: &str,
    ) -> DbResult<MenuItem> {
        if quantity <= 0 {
            return Err(DbError::Domain(
                ValidationError::MustBePositive {
                    field: "quantity".to_string(),
                }
                .into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let item = get_item_on(&mut tx, item_id).await?;
        debug!(item_id, quantity, reason, "Recording waste");

        adjust_stock(&mut tx, &item, -quantity, None).await?;
        insert_movement(
            &mut tx,
            item_id,
            -quantity,
            MovementKind::Waste,
            reason,
            operator,
            None,
        )
        .await?;

        tx.commit().await?;

        self.pool_item(item_id).await
    }

    /// Sets the counter to a counted value after a physical stocktake.
    ///
    /// The movement records the signed difference between the count and
    /// the stored counter, so the ledger still reconciles.
    pub async fn record_correction(
        &self,
        item_id: i64,
        counted_qty: i64,
        reason: &str,
        operator: &str,
    ) -> DbResult<MenuItem> {
        let mut tx = self.pool.begin().await?;

        let item = get_item_on(&mut tx, item_id).await?;
        let delta = counted_qty - item.stock_qty;
        debug!(item_id, counted_qty, delta, "Recording stock correction");

        if delta != 0 {
            adjust_stock(&mut tx, &item, delta, None).await?;
            insert_movement(
                &mut tx,
                item_id,
                delta,
                MovementKind::Correction,
                reason,
                operator,
                None,
            )
            .await?;
        }

        tx.commit().await?;

        self.pool_item(item_id).await
    }

    /// The full movement history of an item, group-wide.
    ///
    /// Resolves the item's stock group (if any), aggregates movements of
    /// every member, and returns per-kind totals plus the itemized detail.
    pub async fn history(&self, item_id: i64) -> DbResult<StockHistory> {
        let item: Option<ItemRow> = sqlx::query_as(&format!("{SELECT_ITEM} WHERE id = ?1"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        let item: MenuItem = item
            .ok_or_else(|| DbError::not_found("Menu item", item_id))?
            .into();

        let rows: Vec<MovementRow> = match &item.stock_group {
            Some(group) => {
                sqlx::query_as(
                    r#"
                    SELECT m.id, m.item_id, m.quantity, m.kind, m.reason,
                           m.operator, m.unit_cost_cents, m.created_at
                    FROM stock_movements m
                    JOIN menu_items i ON i.id = m.item_id
                    WHERE i.stock_group = ?1
                    ORDER BY m.id DESC
                    "#,
                )
                .bind(group)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, item_id, quantity, kind, reason,
                           operator, unit_cost_cents, created_at
                    FROM stock_movements
                    WHERE item_id = ?1
                    ORDER BY id DESC
                    "#,
                )
                .bind(item_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let movements: Vec<StockMovement> = rows
            .into_iter()
            .map(MovementRow::into_movement)
            .collect::<DbResult<_>>()?;

        let mut totals = MovementTotals::default();
        for m in &movements {
            match m.kind {
                MovementKind::Supply => totals.supplied += m.quantity,
                MovementKind::Sale => totals.sold += m.quantity,
                MovementKind::Waste => totals.wasted += m.quantity,
                MovementKind::Correction => totals.corrected += m.quantity,
            }
        }

        Ok(StockHistory {
            item_id,
            stock_group: item.stock_group,
            totals,
            movements,
        })
    }

    async fn pool_item(&self, item_id: i64) -> DbResult<MenuItem> {
        let row: Option<ItemRow> = sqlx::query_as(&format!("{SELECT_ITEM} WHERE id = ?1"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MenuItem::from)
            .ok_or_else(|| DbError::not_found("Menu item", item_id))
    }
}

// =============================================================================
// Transaction-Scoped Helpers
// =============================================================================
//
// Free functions over a borrowed connection, so the finalization
// transaction in `sale.rs` can reuse them inside its own boundary.

/// Fetches an item on an open transaction.
pub(crate) async fn get_item_on(conn: &mut SqliteConnection, item_id: i64) -> DbResult<MenuItem> {
    let row: Option<ItemRow> = sqlx::query_as(&format!("{SELECT_ITEM} WHERE id = ?1"))
        .bind(item_id)
        .fetch_optional(conn)
        .await?;
    row.map(MenuItem::from)
        .ok_or_else(|| DbError::Domain(CoreError::ItemNotFound(item_id.to_string())))
}

/// Applies a counter delta (and optionally a new average cost) to an item
/// or, when it has one, to its entire stock group in a single statement.
pub(crate) async fn adjust_stock(
    conn: &mut SqliteConnection,
    item: &MenuItem,
    delta: i64,
    new_avg: Option<Money>,
) -> DbResult<()> {
    let now = Utc::now();

    let query = match (&item.stock_group, new_avg) {
        (Some(group), Some(avg)) => sqlx::query(
            "UPDATE menu_items SET stock_qty = stock_qty + ?1, avg_cost_cents = ?2, \
             updated_at = ?3 WHERE stock_group = ?4",
        )
        .bind(delta)
        .bind(avg.cents())
        .bind(now)
        .bind(group),
        (Some(group), None) => sqlx::query(
            "UPDATE menu_items SET stock_qty = stock_qty + ?1, updated_at = ?2 \
             WHERE stock_group = ?3",
        )
        .bind(delta)
        .bind(now)
        .bind(group),
        (None, Some(avg)) => sqlx::query(
            "UPDATE menu_items SET stock_qty = stock_qty + ?1, avg_cost_cents = ?2, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(delta)
        .bind(avg.cents())
        .bind(now)
        .bind(item.id),
        (None, None) => sqlx::query(
            "UPDATE menu_items SET stock_qty = stock_qty + ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(delta)
        .bind(now)
        .bind(item.id),
    };

    query.execute(conn).await?;
    Ok(())
}

/// Appends one ledger entry.
pub(crate) async fn insert_movement(
    conn: &mut SqliteConnection,
    item_id: i64,
    quantity: i64,
    kind: MovementKind,
    reason: &str,
    operator: &str,
    unit_cost: Option<Money>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO stock_movements (item_id, quantity, kind, reason, operator, unit_cost_cents, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(item_id)
    .bind(quantity)
    .bind(kind.as_str())
    .bind(reason)
    .bind(operator)
    .bind(unit_cost.map(|c| c.cents()))
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::repository::item::NewMenuItem;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    async fn seed_item(db: &Database, sku: &str, group: Option<&str>) -> MenuItem {
        db.items()
            .insert(NewMenuItem {
                sku: sku.to_string(),
                name: format!("Item {sku}"),
                price: Money::from_cents(450),
                stock_group: group.map(str::to_string),
                track_stock: true,
                low_stock_threshold: 5,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_weighted_average_on_supply() {
        let db = test_db().await;
        let item = seed_item(&db, "WINE", None).await;
        let stock = db.stock();

        // 10 units at $2.00.
        stock
            .receive_supply(item.id, 10, Money::from_cents(2000), "initial", "dana")
            .await
            .unwrap();
        // 10 more for $30.00 total.
        let updated = stock
            .receive_supply(item.id, 10, Money::from_cents(3000), "restock", "dana")
            .await
            .unwrap();

        assert_eq!(updated.stock_qty, 20);
        assert_eq!(updated.avg_cost.cents(), 250);
    }

    #[tokio::test]
    async fn test_supply_movement_records_batch_cost_not_average() {
        let db = test_db().await;
        let item = seed_item(&db, "GIN", None).await;
        let stock = db.stock();

        stock
            .receive_supply(item.id, 10, Money::from_cents(2000), "a", "dana")
            .await
            .unwrap();
        stock
            .receive_supply(item.id, 10, Money::from_cents(3000), "b", "dana")
            .await
            .unwrap();

        let history = stock.history(item.id).await.unwrap();
        // Newest first: the second batch cost $3.00/unit even though the
        // running average is now $2.50.
        assert_eq!(history.movements[0].unit_cost, Some(Money::from_cents(300)));
        assert_eq!(history.movements[1].unit_cost, Some(Money::from_cents(200)));
    }

    #[tokio::test]
    async fn test_group_counters_stay_equal() {
        let db = test_db().await;
        let pint = seed_item(&db, "PINT", Some("keg")).await;
        let half = seed_item(&db, "HALF", Some("keg")).await;
        let stock = db.stock();

        stock
            .receive_supply(pint.id, 50, Money::from_cents(10000), "keg in", "dana")
            .await
            .unwrap();
        stock.record_waste(half.id, 3, "foam", "dana").await.unwrap();

        let pint = db.items().get_by_id(pint.id).await.unwrap().unwrap();
        let half = db.items().get_by_id(half.id).await.unwrap().unwrap();
        assert_eq!(pint.stock_qty, 47);
        assert_eq!(half.stock_qty, 47);
        assert_eq!(pint.avg_cost, half.avg_cost);
    }

    #[tokio::test]
    async fn test_group_history_aggregates_all_members() {
        let db = test_db().await;
        let pint = seed_item(&db, "PINT", Some("keg")).await;
        let half = seed_item(&db, "HALF", Some("keg")).await;
        let stock = db.stock();

        stock
            .receive_supply(pint.id, 50, Money::from_cents(10000), "keg in", "dana")
            .await
            .unwrap();
        stock.record_waste(half.id, 3, "foam", "dana").await.unwrap();

        // Asking through either member tells the same story.
        for id in [pint.id, half.id] {
            let history = stock.history(id).await.unwrap();
            assert_eq!(history.movements.len(), 2);
            assert_eq!(history.totals.supplied, 50);
            assert_eq!(history.totals.wasted, -3);
        }
    }

    #[tokio::test]
    async fn test_correction_records_signed_difference() {
        let db = test_db().await;
        let item = seed_item(&db, "RUM", None).await;
        let stock = db.stock();

        stock
            .receive_supply(item.id, 12, Money::from_cents(2400), "case", "dana")
            .await
            .unwrap();
        let corrected = stock
            .record_correction(item.id, 9, "stocktake", "sam")
            .await
            .unwrap();
        assert_eq!(corrected.stock_qty, 9);

        let history = stock.history(item.id).await.unwrap();
        assert_eq!(history.movements[0].kind, MovementKind::Correction);
        assert_eq!(history.movements[0].quantity, -3);
        assert_eq!(history.totals.corrected, -3);

        // Counting the stored value is a no-op, no phantom movement.
        stock
            .record_correction(item.id, 9, "recount", "sam")
            .await
            .unwrap();
        assert_eq!(stock.history(item.id).await.unwrap().movements.len(), 2);
    }

    #[tokio::test]
    async fn test_legacy_zero_average_not_diluted() {
        let db = test_db().await;
        let item = seed_item(&db, "OLD", None).await;
        let stock = db.stock();

        // Force the legacy shape: stock without cost history.
        stock
            .record_correction(item.id, 20, "migration count", "dana")
            .await
            .unwrap();

        let updated = stock
            .receive_supply(item.id, 4, Money::from_cents(600), "first real batch", "dana")
            .await
            .unwrap();
        // Substituted average stays at the batch rate instead of 600/24.
        assert_eq!(updated.avg_cost.cents(), 150);
    }

    #[tokio::test]
    async fn test_invalid_quantities_rejected() {
        let db = test_db().await;
        let item = seed_item(&db, "BAD", None).await;
        let stock = db.stock();

        assert!(stock
            .receive_supply(item.id, 0, Money::from_cents(100), "", "dana")
            .await
            .is_err());
        assert!(stock.record_waste(item.id, -2, "", "dana").await.is_err());
        assert!(matches!(
            stock
                .receive_supply(9999, 1, Money::from_cents(100), "", "dana")
                .await
                .unwrap_err(),
            DbError::Domain(CoreError::ItemNotFound(_))
        ));
    }
}
