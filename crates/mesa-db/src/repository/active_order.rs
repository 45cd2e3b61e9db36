//! # Active-Order Store
//!
//! The durable, canonical representation of each table's in-progress order.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Active Order Lifecycle                               │
//! │                                                                         │
//! │  first item added          every edit              finalize / emptied   │
//! │       │                        │                          │             │
//! │       ▼                        ▼                          ▼             │
//! │  INSERT row  ────────►  UPDATE (whole line list) ────►  DELETE row      │
//! │                                                                         │
//! │  upsert is one INSERT … ON CONFLICT statement, never read-then-write:  │
//! │  two waiters editing table 5 at once cannot lose each other's commit   │
//! │  ordering at the storage level.                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session-Id Preservation
//! The row's session id is the token the eventual sale will be keyed on.
//! A reconnecting client may replay an edit carrying an offline `temp-…`
//! placeholder; the upsert keeps the stored real session id in that case
//! (decided in SQL, inside the same atomic statement).

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use mesa_core::validation::{validate_order_lines, validate_transfer_selection};
use mesa_core::{ActiveOrder, OrderLine, OrderStatus, SessionId};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ActiveOrderRow {
    table_id: i64,
    session_id: String,
    lines: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ActiveOrderRow {
    fn into_order(self) -> DbResult<ActiveOrder> {
        let lines: Vec<OrderLine> =
            serde_json::from_str(&self.lines).map_err(|e| DbError::CorruptData {
                entity: "active order".to_string(),
                id: self.table_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ActiveOrder {
            table_id: self.table_id,
            session_id: SessionId::new(self.session_id),
            lines,
            status: OrderStatus::Open,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_ORDER: &str =
    "SELECT table_id, session_id, lines, created_at, updated_at FROM active_orders";

// =============================================================================
// Repository
// =============================================================================

/// Repository for the per-table active-order store.
#[derive(Debug, Clone)]
pub struct ActiveOrderRepository {
    pool: SqlitePool,
}

impl ActiveOrderRepository {
    /// Creates a new ActiveOrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ActiveOrderRepository { pool }
    }

    /// Gets the active order for a table, if the table is occupied.
    pub async fn get(&self, table_id: i64) -> DbResult<Option<ActiveOrder>> {
        let row: Option<ActiveOrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} WHERE table_id = ?1"))
                .bind(table_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ActiveOrderRow::into_order).transpose()
    }

    /// The full current set of active orders, the payload every state
    /// broadcast carries.
    pub async fn get_all(&self) -> DbResult<Vec<ActiveOrder>> {
        let rows: Vec<ActiveOrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} ORDER BY table_id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ActiveOrderRow::into_order).collect()
    }

    /// Inserts or replaces the order for a table.
    ///
    /// ## Semantics
    /// - Empty `lines` means the table was cleared: the row is deleted.
    /// - On update, the stored session id survives unless the incoming
    ///   one is genuine (placeholders never displace a real session).
    /// - The whole decision runs in one SQL statement; concurrent editors
    ///   of the same table serialize on the row, not on a read-then-write
    ///   race window.
    pub async fn upsert(
        &self,
        table_id: i64,
        session_id: &SessionId,
        lines: &[OrderLine],
    ) -> DbResult<()> {
        validate_order_lines(lines)?;

        if lines.is_empty() {
            debug!(table_id, "Upsert with no lines, clearing table");
            return self.clear(table_id).await;
        }

        let mut conn = self.pool.acquire().await?;
        upsert_on(&mut conn, table_id, session_id, lines).await?;
        Ok(())
    }

    /// Deletes a table's order. Idempotent: clearing a free table is a
    /// no-op, not an error (finalize and explicit clear can race).
    pub async fn clear(&self, table_id: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM active_orders WHERE table_id = ?1")
            .bind(table_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves lines from one table to another, atomically.
    ///
    /// ## Semantics
    /// - `line_ids` empty means the whole order moves.
    /// - Moved lines are appended to the destination; identical products
    ///   are never merged into one summed line (each line keeps its own
    ///   id and history).
    /// - If the source ends up empty its row is deleted.
    /// - A free destination table adopts the source's session id on a
    ///   whole-order move, and gets a fresh session for a partial one.
    ///
    /// ## Edge Cases
    /// - Source not occupied: `NotFound`.
    /// - Selection resolves to zero known lines: validation error, and
    ///   nothing moves.
    /// - Source and destination equal: validation error.
    pub async fn transfer(
        &self,
        from_table: i64,
        to_table: i64,
        line_ids: &[String],
    ) -> DbResult<()> {
        if from_table == to_table {
            return Err(mesa_core::ValidationError::InvalidFormat {
                field: "to_table".to_string(),
                reason: "cannot transfer a table onto itself".to_string(),
            }
            .map_into());
        }

        let mut tx = self.pool.begin().await?;

        let source: Option<ActiveOrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} WHERE table_id = ?1"))
                .bind(from_table)
                .fetch_optional(&mut *tx)
                .await?;
        let source = source
            .ok_or_else(|| DbError::not_found("Active order", from_table))?
            .into_order()?;

        validate_transfer_selection(&source.lines, line_ids)?;

        let (moved, remaining): (Vec<OrderLine>, Vec<OrderLine>) = if line_ids.is_empty() {
            (source.lines, Vec::new())
        } else {
            source
                .lines
                .into_iter()
                .partition(|l| line_ids.iter().any(|id| *id == l.line_id))
        };

        debug!(
            from_table,
            to_table,
            moved = moved.len(),
            remaining = remaining.len(),
            "Transferring order lines"
        );

        // Destination: append to an existing order, or open a new one.
        let dest: Option<ActiveOrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} WHERE table_id = ?1"))
                .bind(to_table)
                .fetch_optional(&mut *tx)
                .await?;

        match dest {
            Some(row) => {
                let mut dest_order = row.into_order()?;
                dest_order.lines.extend(moved);
                validate_order_lines(&dest_order.lines)?;
                upsert_on(&mut *tx, to_table, &dest_order.session_id, &dest_order.lines)
                    .await?;
            }
            None => {
                // A whole-order move carries its session along so an
                // in-flight payment still matches; a partial move is a
                // new order with its own session.
                let session = if remaining.is_empty() {
                    source.session_id.clone()
                } else {
                    SessionId::generate()
                };
                upsert_on(&mut *tx, to_table, &session, &moved).await?;
            }
        }

        if remaining.is_empty() {
            sqlx::query("DELETE FROM active_orders WHERE table_id = ?1")
                .bind(from_table)
                .execute(&mut *tx)
                .await?;
        } else {
            upsert_on(&mut *tx, from_table, &source.session_id, &remaining).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// The atomic insert-or-update statement, shared by the pool path and the
/// transfer transaction.
///
/// The CASE keeps a stored genuine session id when the incoming one is a
/// placeholder; everything else is replaced wholesale.
pub(crate) async fn upsert_on(
    conn: &mut SqliteConnection,
    table_id: i64,
    session_id: &SessionId,
    lines: &[OrderLine],
) -> DbResult<()> {
    let lines_json =
        serde_json::to_string(lines).map_err(|e| DbError::Internal(e.to_string()))?;
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO active_orders (table_id, session_id, lines, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'open', ?4, ?4)
        ON CONFLICT(table_id) DO UPDATE SET
            lines = excluded.lines,
            updated_at = excluded.updated_at,
            session_id = CASE
                WHEN excluded.session_id = '' OR excluded.session_id LIKE 'temp-%'
                    THEN active_orders.session_id
                ELSE excluded.session_id
            END
        "#,
    )
    .bind(table_id)
    .bind(session_id.as_str())
    .bind(lines_json)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

// Small helper so validation errors read naturally at call sites.
trait MapInto {
    fn map_into(self) -> DbError;
}

impl MapInto for mesa_core::ValidationError {
    fn map_into(self) -> DbError {
        DbError::Domain(self.into())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use mesa_core::Money;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn line(name: &str) -> OrderLine {
        OrderLine::new("42", name, Money::from_cents(300), 1)
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let db = test_db().await;
        let orders = db.active_orders();
        let session = SessionId::generate();

        orders.upsert(5, &session, &[line("Soup")]).await.unwrap();
        let stored = orders.get(5).await.unwrap().unwrap();
        assert_eq!(stored.lines.len(), 1);
        assert_eq!(stored.session_id, session);

        orders
            .upsert(5, &session, &[line("Soup"), line("Bread")])
            .await
            .unwrap();
        let stored = orders.get(5).await.unwrap().unwrap();
        assert_eq!(stored.lines.len(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_session_never_displaces_real_one() {
        let db = test_db().await;
        let orders = db.active_orders();
        let real = SessionId::generate();

        orders.upsert(3, &real, &[line("Soup")]).await.unwrap();

        // A reconnecting client replays the edit with its offline token.
        orders
            .upsert(3, &SessionId::placeholder(), &[line("Soup"), line("Wine")])
            .await
            .unwrap();

        let stored = orders.get(3).await.unwrap().unwrap();
        assert_eq!(stored.session_id, real);
        assert_eq!(stored.lines.len(), 2);

        // A genuine session does replace.
        let newer = SessionId::generate();
        orders.upsert(3, &newer, &[line("Soup")]).await.unwrap();
        assert_eq!(orders.get(3).await.unwrap().unwrap().session_id, newer);
    }

    #[tokio::test]
    async fn test_empty_lines_deletes_row() {
        let db = test_db().await;
        let orders = db.active_orders();

        orders
            .upsert(7, &SessionId::generate(), &[line("Soup")])
            .await
            .unwrap();
        orders.upsert(7, &SessionId::generate(), &[]).await.unwrap();

        assert!(orders.get(7).await.unwrap().is_none());
        // Clearing again is a no-op, not an error.
        orders.clear(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_partial_leaves_rest_behind() {
        let db = test_db().await;
        let orders = db.active_orders();

        let lines: Vec<OrderLine> = (0..5).map(|i| line(&format!("Dish {i}"))).collect();
        orders
            .upsert(1, &SessionId::generate(), &lines)
            .await
            .unwrap();

        let moved_ids = vec![lines[0].line_id.clone(), lines[3].line_id.clone()];
        orders.transfer(1, 2, &moved_ids).await.unwrap();

        let source = orders.get(1).await.unwrap().unwrap();
        let dest = orders.get(2).await.unwrap().unwrap();
        assert_eq!(source.lines.len(), 3);
        assert_eq!(dest.lines.len(), 2);
        assert!(dest.lines.iter().any(|l| l.line_id == moved_ids[0]));
    }

    #[tokio::test]
    async fn test_transfer_appends_without_merging() {
        let db = test_db().await;
        let orders = db.active_orders();

        // Same product on both tables; after the move the destination
        // must hold two distinct lines, not one with quantity 2.
        let a = line("Espresso");
        let b = line("Espresso");
        orders
            .upsert(1, &SessionId::generate(), &[a.clone()])
            .await
            .unwrap();
        orders
            .upsert(2, &SessionId::generate(), &[b.clone()])
            .await
            .unwrap();

        orders.transfer(1, 2, &[]).await.unwrap();

        assert!(orders.get(1).await.unwrap().is_none());
        let dest = orders.get(2).await.unwrap().unwrap();
        assert_eq!(dest.lines.len(), 2);
        assert_ne!(dest.lines[0].line_id, dest.lines[1].line_id);
    }

    #[tokio::test]
    async fn test_whole_transfer_to_free_table_keeps_session() {
        let db = test_db().await;
        let orders = db.active_orders();
        let session = SessionId::generate();

        orders.upsert(4, &session, &[line("Soup")]).await.unwrap();
        orders.transfer(4, 9, &[]).await.unwrap();

        let dest = orders.get(9).await.unwrap().unwrap();
        assert_eq!(dest.session_id, session);
    }

    #[tokio::test]
    async fn test_transfer_error_cases_move_nothing() {
        let db = test_db().await;
        let orders = db.active_orders();

        // Unoccupied source.
        let err = orders.transfer(1, 2, &[]).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));

        // Unknown selection.
        let l = line("Soup");
        orders
            .upsert(1, &SessionId::generate(), &[l])
            .await
            .unwrap();
        let err = orders
            .transfer(1, 2, &["no-such-line".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Domain(_)));
        assert_eq!(orders.get(1).await.unwrap().unwrap().lines.len(), 1);
        assert!(orders.get(2).await.unwrap().is_none());

        // Self transfer.
        let err = orders.transfer(1, 1, &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Domain(_)));
    }

    #[tokio::test]
    async fn test_get_all_is_table_ordered() {
        let db = test_db().await;
        let orders = db.active_orders();

        for table in [9, 2, 5] {
            orders
                .upsert(table, &SessionId::generate(), &[line("Soup")])
                .await
                .unwrap();
        }

        let all = orders.get_all().await.unwrap();
        let tables: Vec<i64> = all.iter().map(|o| o.table_id).collect();
        assert_eq!(tables, vec![2, 5, 9]);
    }
}
