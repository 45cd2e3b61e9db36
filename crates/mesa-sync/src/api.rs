//! # Hub HTTP API
//!
//! JSON routes the mutation queue replays against. Every route writes
//! through the same store the WebSocket path uses, and every successful
//! mutation triggers the same canonical-state broadcast, so HTTP-replayed
//! edits and live edits are indistinguishable to connected devices.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST /api/orders/upsert       replace a table's line list              │
//! │  POST /api/orders/clear        delete a table's order                   │
//! │  POST /api/orders/transfer     move all/selected lines between tables   │
//! │  POST /api/sales/finalize      idempotent commit; dup session ⇒ 409     │
//! │  POST /api/stock/supply        goods received, weighted-average update  │
//! │  POST /api/stock/waste         spoilage/breakage                        │
//! │  POST /api/stock/correction    counted-quantity correction              │
//! │  GET  /api/stock/history/{id}  group-wide movement history              │
//! │  POST /api/catalog/apply       menu-item mutations (forwarded op)       │
//! │  GET  /health                  liveness + database reachability         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Mapping
//! - duplicate finalize session → 409 with an "already paid" body; the
//!   client treats this as success
//! - unknown entity → 404 with a JSON body (a bodiless 404 means "no
//!   such route" to the replaying client)
//! - validation failures → 422
//! - unsupported catalog kinds → 501

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use mesa_core::{MenuItem, Money, MutationOp, OrderLine, Sale, SessionId};
use mesa_db::{Database, DbError, FinalizeSaleRequest, NewMenuItem, StockHistory};

use crate::protocol::{ReplicaMessage, SaleFinalizedPayload, StatePayload};

// =============================================================================
// API Context
// =============================================================================

/// Shared state for the API routes.
pub struct ApiContext {
    pub db: Arc<Database>,

    /// Hub-wide event channel; every connected WebSocket client has a
    /// forwarding task subscribed to it.
    pub events: broadcast::Sender<ReplicaMessage>,
}

impl ApiContext {
    /// Sends the canonical post-write state to every connected device.
    ///
    /// Always reads back from the store; never broadcasts what the
    /// caller sent.
    pub async fn broadcast_state(&self) {
        match self.db.active_orders().get_all().await {
            Ok(orders) => {
                // Send fails only when no client is connected.
                let _ = self
                    .events
                    .send(ReplicaMessage::StateBroadcast(StatePayload { orders }));
            }
            Err(e) => error!(error = %e, "Failed to read state for broadcast"),
        }
    }
}

/// Builds the API router.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/api/orders/upsert", post(upsert_order))
        .route("/api/orders/clear", post(clear_order))
        .route("/api/orders/transfer", post(transfer_order))
        .route("/api/sales/finalize", post(finalize_sale))
        .route("/api/stock/supply", post(stock_supply))
        .route("/api/stock/waste", post(stock_waste))
        .route("/api/stock/correction", post(stock_correction))
        .route("/api/stock/history/{item_id}", get(stock_history))
        .route("/api/catalog/apply", post(catalog_apply))
        .route("/health", get(health))
        .with_state(ctx)
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Wraps `DbError` with an HTTP status mapping.
pub struct ApiError(DbError);

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            DbError::AlreadyPaid {
                session_id,
                sale_id,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "already paid",
                    "sessionId": session_id,
                    "saleId": sale_id,
                }),
            ),
            DbError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, json!({ "error": self.0.to_string() }))
            }
            e if e.is_client_fault() => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": self.0.to_string() }),
            ),
            _ => {
                error!(error = %self.0, "API request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Order Routes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertOrderRequest {
    table_id: i64,
    session_id: SessionId,
    #[serde(default)]
    lines: Vec<OrderLine>,
}

async fn upsert_order(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<UpsertOrderRequest>,
) -> ApiResult<StatusCode> {
    ctx.db
        .active_orders()
        .upsert(req.table_id, &req.session_id, &req.lines)
        .await?;
    ctx.broadcast_state().await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearOrderRequest {
    table_id: i64,
}

async fn clear_order(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<ClearOrderRequest>,
) -> ApiResult<StatusCode> {
    ctx.db.active_orders().clear(req.table_id).await?;
    ctx.broadcast_state().await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest {
    from_table: i64,
    to_table: i64,
    #[serde(default)]
    line_ids: Vec<String>,
}

async fn transfer_order(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<StatusCode> {
    ctx.db
        .active_orders()
        .transfer(req.from_table, req.to_table, &req.line_ids)
        .await?;
    ctx.broadcast_state().await;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Sale Routes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeRequest {
    table_id: i64,
    session_id: SessionId,
    display_id: String,
    operator: String,
    lines: Vec<OrderLine>,
    /// Tax in cents.
    tax: Money,
}

async fn finalize_sale(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<FinalizeRequest>,
) -> ApiResult<Json<Sale>> {
    let sale = ctx
        .db
        .sales()
        .finalize(FinalizeSaleRequest {
            table_id: req.table_id,
            session_id: req.session_id,
            display_id: req.display_id,
            operator: req.operator,
            lines: req.lines,
            tax: req.tax,
        })
        .await?;

    info!(sale_id = sale.id, display_id = %sale.display_id, "Sale finalized");

    // The active order is gone; connected devices need both the freed
    // table and the sale event.
    ctx.broadcast_state().await;
    let _ = ctx
        .events
        .send(ReplicaMessage::SaleFinalized(SaleFinalizedPayload {
            sale_id: sale.id,
            display_id: sale.display_id.clone(),
            table_id: sale.table_id,
            total: sale.total.cents(),
        }));

    Ok(Json(sale))
}

// =============================================================================
// Stock Routes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SupplyRequest {
    item_id: i64,
    quantity: i64,
    /// Total batch cost in cents.
    total_cost: Money,
    #[serde(default)]
    reason: String,
    operator: String,
}

async fn stock_supply(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<SupplyRequest>,
) -> ApiResult<Json<MenuItem>> {
    let item = ctx
        .db
        .stock()
        .receive_supply(
            req.item_id,
            req.quantity,
            req.total_cost,
            &req.reason,
            &req.operator,
        )
        .await?;
    Ok(Json(item))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WasteRequest {
    item_id: i64,
    quantity: i64,
    reason: String,
    operator: String,
}

async fn stock_waste(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<WasteRequest>,
) -> ApiResult<Json<MenuItem>> {
    let item = ctx
        .db
        .stock()
        .record_waste(req.item_id, req.quantity, &req.reason, &req.operator)
        .await?;
    Ok(Json(item))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorrectionRequest {
    item_id: i64,
    counted_qty: i64,
    reason: String,
    operator: String,
}

async fn stock_correction(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<CorrectionRequest>,
) -> ApiResult<Json<MenuItem>> {
    let item = ctx
        .db
        .stock()
        .record_correction(req.item_id, req.counted_qty, &req.reason, &req.operator)
        .await?;
    Ok(Json(item))
}

async fn stock_history(
    State(ctx): State<Arc<ApiContext>>,
    Path(item_id): Path<i64>,
) -> ApiResult<Json<StockHistory>> {
    let history = ctx.db.stock().history(item_id).await?;
    Ok(Json(history))
}

// =============================================================================
// Catalog Route
// =============================================================================

/// Applies a catalog-family mutation forwarded whole by the client.
///
/// Menu-item kinds are applied; category and operator-account kinds are
/// answered 501 so the replaying client can tell "this hub does not do
/// that" apart from a failure.
async fn catalog_apply(
    State(ctx): State<Arc<ApiContext>>,
    Json(op): Json<MutationOp>,
) -> ApiResult<Response> {
    match op {
        MutationOp::UpsertMenuItem {
            sku,
            name,
            price,
            stock_group,
            track_stock,
        } => {
            let items = ctx.db.items();
            match items.get_by_sku(&sku).await? {
                Some(existing) => {
                    items
                        .update_details(existing.id, &name, price, existing.low_stock_threshold)
                        .await?;
                }
                None => {
                    items
                        .insert(NewMenuItem {
                            sku,
                            name,
                            price,
                            stock_group,
                            track_stock,
                            low_stock_threshold: 0,
                        })
                        .await?;
                }
            }
            Ok(StatusCode::NO_CONTENT.into_response())
        }

        MutationOp::DeleteMenuItem { item_id } => {
            ctx.db.items().delete(item_id).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }

        other => {
            warn!(kind = other.kind(), "Unsupported catalog operation");
            Ok((
                StatusCode::NOT_IMPLEMENTED,
                Json(json!({ "error": format!("unsupported operation '{}'", other.kind()) })),
            )
                .into_response())
        }
    }
}

// =============================================================================
// Health Route
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> Response {
    if ctx.db.health_check().await {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "database unreachable" })),
        )
            .into_response()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_db::DbConfig;

    async fn test_context() -> (Arc<ApiContext>, broadcast::Receiver<ReplicaMessage>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (events, rx) = broadcast::channel(16);
        (
            Arc::new(ApiContext {
                db: Arc::new(db),
                events,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_broadcast_carries_persisted_state() {
        let (ctx, mut rx) = test_context().await;

        let session = SessionId::generate();
        let lines = vec![OrderLine::new("1", "Espresso", Money::from_cents(250), 2)];
        ctx.db
            .active_orders()
            .upsert(5, &session, &lines)
            .await
            .unwrap();

        ctx.broadcast_state().await;

        match rx.recv().await.unwrap() {
            ReplicaMessage::StateBroadcast(payload) => {
                assert_eq!(payload.orders.len(), 1);
                assert_eq!(payload.orders[0].table_id, 5);
            }
            other => panic!("wrong message kind: {}", other.kind()),
        }
    }

    mod end_to_end {
        use super::*;
        use std::sync::Arc;

        use async_trait::async_trait;
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

        use crate::error::{SyncError, SyncResult};
        use crate::queue::{DrainOutcome, MutationQueue, SqliteQueueStore};
        use crate::remote::{FinalizePayload, RemoteApi};

        /// `RemoteApi` wired straight into the store, mirroring what the
        /// HTTP routes do, so the offline-to-paid flow runs in-process.
        struct StoreRemote {
            ctx: Arc<ApiContext>,
        }

        #[async_trait]
        impl RemoteApi for StoreRemote {
            async fn upsert_order(
                &self,
                table_id: i64,
                session_id: &SessionId,
                lines: &[OrderLine],
            ) -> SyncResult<()> {
                self.ctx
                    .db
                    .active_orders()
                    .upsert(table_id, session_id, lines)
                    .await?;
                self.ctx.broadcast_state().await;
                Ok(())
            }

            async fn clear_order(&self, table_id: i64) -> SyncResult<()> {
                self.ctx.db.active_orders().clear(table_id).await?;
                self.ctx.broadcast_state().await;
                Ok(())
            }

            async fn transfer_order(
                &self,
                from_table: i64,
                to_table: i64,
                line_ids: &[String],
            ) -> SyncResult<()> {
                self.ctx
                    .db
                    .active_orders()
                    .transfer(from_table, to_table, line_ids)
                    .await?;
                self.ctx.broadcast_state().await;
                Ok(())
            }

            async fn finalize_sale(&self, payload: &FinalizePayload) -> SyncResult<()> {
                let result = self
                    .ctx
                    .db
                    .sales()
                    .finalize(FinalizeSaleRequest {
                        table_id: payload.table_id,
                        session_id: payload.session_id.clone(),
                        display_id: payload.display_id.clone(),
                        operator: payload.operator.clone(),
                        lines: payload.lines.clone(),
                        tax: payload.tax,
                    })
                    .await;
                match result {
                    Ok(_) => {
                        self.ctx.broadcast_state().await;
                        Ok(())
                    }
                    // Same rule as HttpRemote: a duplicate session means
                    // the intent is already satisfied.
                    Err(DbError::AlreadyPaid { .. }) => Ok(()),
                    Err(e) => Err(SyncError::from(e)),
                }
            }

            async fn record_supply(
                &self,
                item_id: i64,
                quantity: i64,
                total_cost: Money,
                reason: &str,
                operator: &str,
            ) -> SyncResult<()> {
                self.ctx
                    .db
                    .stock()
                    .receive_supply(item_id, quantity, total_cost, reason, operator)
                    .await?;
                Ok(())
            }

            async fn record_waste(
                &self,
                item_id: i64,
                quantity: i64,
                reason: &str,
                operator: &str,
            ) -> SyncResult<()> {
                self.ctx
                    .db
                    .stock()
                    .record_waste(item_id, quantity, reason, operator)
                    .await?;
                Ok(())
            }

            async fn apply_catalog(&self, op: &MutationOp) -> SyncResult<()> {
                Err(SyncError::RemoteUnsupported {
                    kind: op.kind().into(),
                })
            }

            async fn set_setting(&self, _key: &str, _value: &str) -> SyncResult<()> {
                Err(SyncError::RemoteUnsupported {
                    kind: "set_setting".into(),
                })
            }
        }

        async fn memory_queue() -> MutationQueue {
            let options = SqliteConnectOptions::new()
                .filename(":memory:")
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            MutationQueue::new(Arc::new(SqliteQueueStore::new(pool).await.unwrap()))
        }

        /// Offline enqueue, drain, broadcast, finalize, replay: the whole
        /// table-5 story from disconnected edit to exactly one Sale row.
        #[tokio::test]
        async fn test_offline_edit_to_paid_sale() {
            let (ctx, mut events) = test_context().await;
            let remote = StoreRemote { ctx: ctx.clone() };
            let queue = memory_queue().await;

            let item = ctx
                .db
                .items()
                .insert(mesa_db::NewMenuItem {
                    sku: "ESP".into(),
                    name: "Espresso".into(),
                    price: Money::from_cents(250),
                    stock_group: None,
                    track_stock: false,
                    low_stock_threshold: 0,
                })
                .await
                .unwrap();

            let session = SessionId::generate();
            let line = OrderLine::new(
                item.id.to_string(),
                "Espresso",
                Money::from_cents(250),
                1,
            );

            // Offline: the edit lands in the queue, not on the wire.
            queue
                .enqueue(MutationOp::UpsertActiveOrder {
                    table_id: 5,
                    session_id: session.clone(),
                    lines: vec![line.clone()],
                })
                .await
                .unwrap();

            // Back online: drain applies it and the broadcast shows it.
            let outcome = queue.drain(&remote).await.unwrap();
            assert!(matches!(outcome, DrainOutcome::Success { applied: 1, .. }));
            match events.recv().await.unwrap() {
                ReplicaMessage::StateBroadcast(payload) => {
                    assert_eq!(payload.orders.len(), 1);
                    assert_eq!(payload.orders[0].table_id, 5);
                    assert_eq!(payload.orders[0].lines[0].name, "Espresso");
                }
                other => panic!("wrong message kind: {}", other.kind()),
            }

            // Finalize through the queue as well.
            let finalize = MutationOp::FinalizeSale {
                table_id: 5,
                session_id: session.clone(),
                display_id: "S-0100".into(),
                operator: "dana".into(),
                lines: vec![line],
                tax: Money::zero(),
            };
            queue.enqueue(finalize.clone()).await.unwrap();
            let outcome = queue.drain(&remote).await.unwrap();
            assert!(matches!(outcome, DrainOutcome::Success { applied: 1, .. }));

            // The table is free and the sale exists with its one line.
            assert!(ctx.db.active_orders().get(5).await.unwrap().is_none());
            let sale = ctx
                .db
                .sales()
                .get_by_session(&session)
                .await
                .unwrap()
                .expect("sale missing");
            let lines = ctx.db.sales().lines(sale.id).await.unwrap();
            assert_eq!(lines.len(), 1);
            assert_eq!(lines[0].product_id, item.id);

            // A queued replay of the same finalize is satisfied without
            // a second Sale row.
            queue.enqueue(finalize).await.unwrap();
            let outcome = queue.drain(&remote).await.unwrap();
            assert!(matches!(outcome, DrainOutcome::Success { applied: 1, .. }));
            let recent = ctx.db.sales().recent(10).await.unwrap();
            assert_eq!(recent.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_already_paid_maps_to_conflict() {
        let err = DbError::AlreadyPaid {
            session_id: "abc".into(),
            sale_id: 7,
        };
        let response = ApiError(err).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_not_found_keeps_a_body() {
        let err = DbError::NotFound {
            entity: "Active order".into(),
            id: "9".into(),
        };
        let response = ApiError(err).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // The replaying client reads a bodiless 404 as "route missing";
        // entity lookups must answer with a body.
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(!body.is_empty());
    }
}
