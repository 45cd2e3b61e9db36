//! # Item Repository
//!
//! Catalog CRUD. Stock counters and average cost live on the item row but
//! are written only by [`crate::repository::stock`] and the finalization
//! transaction; this repository treats them as read-only.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use mesa_core::{MenuItem, Money};

// =============================================================================
// Row Mapping
// =============================================================================

/// Raw row shape; converted to the domain type at the repository boundary.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub stock_group: Option<String>,
    pub track_stock: bool,
    pub stock_qty: i64,
    pub avg_cost_cents: i64,
    pub low_stock_threshold: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ItemRow> for MenuItem {
    fn from(row: ItemRow) -> Self {
        MenuItem {
            id: row.id,
            sku: row.sku,
            name: row.name,
            price: Money::from_cents(row.price_cents),
            stock_group: row.stock_group,
            track_stock: row.track_stock,
            stock_qty: row.stock_qty,
            avg_cost: Money::from_cents(row.avg_cost_cents),
            low_stock_threshold: row.low_stock_threshold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub(crate) const SELECT_ITEM: &str = "\
    SELECT id, sku, name, price_cents, stock_group, track_stock, \
           stock_qty, avg_cost_cents, low_stock_threshold, created_at, updated_at \
    FROM menu_items";

// =============================================================================
// New Item
// =============================================================================

/// Fields required to create a catalog item.
#[derive(Debug, Clone)]
pub struct NewMenuItem {
    pub sku: String,
    pub name: String,
    pub price: Money,
    pub stock_group: Option<String>,
    pub track_stock: bool,
    pub low_stock_threshold: i64,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for catalog operations.
#[derive(Debug, Clone)]
pub struct ItemRepository {
    pool: SqlitePool,
}

impl ItemRepository {
    /// Creates a new ItemRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ItemRepository { pool }
    }

    /// Inserts a catalog item and returns it with its assigned id.
    ///
    /// A new member of an existing stock group inherits the group's
    /// current counter and average cost, so the shared-counter invariant
    /// holds from the moment of creation.
    pub async fn insert(&self, item: NewMenuItem) -> DbResult<MenuItem> {
        let now = Utc::now();
        debug!(sku = %item.sku, "Inserting menu item");

        let (stock_qty, avg_cost) = match &item.stock_group {
            Some(group) => self
                .group_counter(group)
                .await?
                .unwrap_or((0, Money::zero())),
            None => (0, Money::zero()),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO menu_items (
                sku, name, price_cents, stock_group, track_stock,
                stock_qty, avg_cost_cents, low_stock_threshold,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
        )
        .bind(&item.sku)
        .bind(&item.name)
        .bind(item.price.cents())
        .bind(&item.stock_group)
        .bind(item.track_stock)
        .bind(stock_qty)
        .bind(avg_cost.cents())
        .bind(item.low_stock_threshold)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_by_id(result.last_insert_rowid())
            .await?
            .ok_or_else(|| DbError::Internal("inserted item vanished".to_string()))
    }

    /// Gets an item by id.
    pub async fn get_by_id(&self, id: i64) -> DbResult<Option<MenuItem>> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("{SELECT_ITEM} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(MenuItem::from))
    }

    /// Gets an item by SKU.
    pub async fn get_by_sku(&self, sku: &str) -> DbResult<Option<MenuItem>> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("{SELECT_ITEM} WHERE sku = ?1"))
                .bind(sku)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(MenuItem::from))
    }

    /// Lists the whole catalog, name-ordered.
    pub async fn list(&self) -> DbResult<Vec<MenuItem>> {
        let rows: Vec<ItemRow> =
            sqlx::query_as(&format!("{SELECT_ITEM} ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(MenuItem::from).collect())
    }

    /// Lists every member of a stock group.
    pub async fn list_group(&self, stock_group: &str) -> DbResult<Vec<MenuItem>> {
        let rows: Vec<ItemRow> =
            sqlx::query_as(&format!("{SELECT_ITEM} WHERE stock_group = ?1 ORDER BY id"))
                .bind(stock_group)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(MenuItem::from).collect())
    }

    /// Updates name, price and threshold of an existing item.
    ///
    /// Stock fields are deliberately excluded; those change only through
    /// ledger operations.
    pub async fn update_details(
        &self,
        id: i64,
        name: &str,
        price: Money,
        low_stock_threshold: i64,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE menu_items
            SET name = ?2, price_cents = ?3, low_stock_threshold = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(price.cents())
        .bind(low_stock_threshold)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Menu item", id));
        }
        Ok(())
    }

    /// Deletes an item.
    ///
    /// Fails with a foreign-key violation if the item has ledger history;
    /// history must outlive the catalog entry.
    pub async fn delete(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM menu_items WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Menu item", id));
        }
        Ok(())
    }

    /// Current (counter, average cost) of a stock group, if it has members.
    async fn group_counter(&self, stock_group: &str) -> DbResult<Option<(i64, Money)>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT stock_qty, avg_cost_cents FROM menu_items WHERE stock_group = ?1 LIMIT 1",
        )
        .bind(stock_group)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(qty, cents)| (qty, Money::from_cents(cents))))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn new_item(sku: &str, group: Option<&str>) -> NewMenuItem {
        NewMenuItem {
            sku: sku.to_string(),
            name: format!("Item {sku}"),
            price: Money::from_cents(500),
            stock_group: group.map(str::to_string),
            track_stock: group.is_some(),
            low_stock_threshold: 5,
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let db = test_db().await;
        let items = db.items();

        let created = items.insert(new_item("ESP-1", None)).await.unwrap();
        assert!(created.id > 0);

        let by_id = items.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(by_id.sku, "ESP-1");
        assert_eq!(by_id.price.cents(), 500);

        let by_sku = items.get_by_sku("ESP-1").await.unwrap().unwrap();
        assert_eq!(by_sku.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_sku_rejected() {
        let db = test_db().await;
        let items = db.items();

        items.insert(new_item("DUP", None)).await.unwrap();
        let err = items.insert(new_item("DUP", None)).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_new_group_member_inherits_counter() {
        let db = test_db().await;
        let items = db.items();

        let pint = items.insert(new_item("PINT", Some("keg-ipa"))).await.unwrap();
        db.stock()
            .receive_supply(pint.id, 40, Money::from_cents(8000), "delivery", "dana")
            .await
            .unwrap();

        let half = items.insert(new_item("HALF", Some("keg-ipa"))).await.unwrap();
        assert_eq!(half.stock_qty, 40);
        assert_eq!(half.avg_cost.cents(), 200);
    }

    #[tokio::test]
    async fn test_update_details_leaves_stock_alone() {
        let db = test_db().await;
        let items = db.items();

        let item = items.insert(new_item("SOUP", None)).await.unwrap();
        items
            .update_details(item.id, "Onion Soup", Money::from_cents(750), 2)
            .await
            .unwrap();

        let updated = items.get_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "Onion Soup");
        assert_eq!(updated.price.cents(), 750);
        assert_eq!(updated.stock_qty, item.stock_qty);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let db = test_db().await;
        let err = db.items().delete(9999).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
