//! # Remote API
//!
//! The server-side surface the mutation queue replays against.
//!
//! ## Replay Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Queue Replay Surface                             │
//! │                                                                         │
//! │  MutationQueue::drain                                                   │
//! │        │                                                                │
//! │        │  dispatch(remote, op)     one method per operation family      │
//! │        ▼                                                                │
//! │  ┌───────────────┐        ┌──────────────────────────────────────────┐ │
//! │  │  RemoteApi    │        │  HttpRemote (reqwest)                    │ │
//! │  │  (trait)      │──────► │                                          │ │
//! │  │               │        │  POST /api/orders/upsert                 │ │
//! │  │  tests plug   │        │  POST /api/orders/clear                  │ │
//! │  │  in a mock    │        │  POST /api/orders/transfer               │ │
//! │  │               │        │  POST /api/sales/finalize   409 ⇒ Ok     │ │
//! │  │               │        │  POST /api/stock/supply                  │ │
//! │  │               │        │  POST /api/stock/waste                   │ │
//! │  │               │        │  POST /api/catalog/apply                 │ │
//! │  │               │        │  POST /api/settings                      │ │
//! │  └───────────────┘        └──────────────────────────────────────────┘ │
//! │                                                                         │
//! │  IDEMPOTENCY lives server-side (session-id dedup in finalize);         │
//! │  this layer only maps transport results onto queue semantics.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use mesa_core::{Money, MutationOp, OrderLine, SessionId};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Constants
// =============================================================================

/// Per-request timeout for replay calls.
const REQUEST_TIMEOUT_SECS: u64 = 15;

// =============================================================================
// Remote API Trait
// =============================================================================

/// Finalize payload as the server expects it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizePayload {
    pub table_id: i64,
    pub session_id: SessionId,
    pub display_id: String,
    pub operator: String,
    pub lines: Vec<OrderLine>,
    /// Tax in cents.
    pub tax: Money,
}

/// The remote calls the queue replays.
///
/// One method per operation family; `dispatch` routes a [`MutationOp`]
/// to the right one. Tests substitute a mock implementation.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn upsert_order(
        &self,
        table_id: i64,
        session_id: &SessionId,
        lines: &[OrderLine],
    ) -> SyncResult<()>;

    async fn clear_order(&self, table_id: i64) -> SyncResult<()>;

    async fn transfer_order(
        &self,
        from_table: i64,
        to_table: i64,
        line_ids: &[String],
    ) -> SyncResult<()>;

    /// Must treat the server's duplicate-session "already paid" reply as
    /// success, so queue retries stay safe.
    async fn finalize_sale(&self, payload: &FinalizePayload) -> SyncResult<()>;

    async fn record_supply(
        &self,
        item_id: i64,
        quantity: i64,
        total_cost: Money,
        reason: &str,
        operator: &str,
    ) -> SyncResult<()>;

    async fn record_waste(
        &self,
        item_id: i64,
        quantity: i64,
        reason: &str,
        operator: &str,
    ) -> SyncResult<()>;

    /// Catalog family (items, categories, operator accounts). The op is
    /// forwarded whole; the server decides which kinds it supports.
    async fn apply_catalog(&self, op: &MutationOp) -> SyncResult<()>;

    async fn set_setting(&self, key: &str, value: &str) -> SyncResult<()>;
}

/// Routes one queued operation to its `RemoteApi` method.
pub async fn dispatch(remote: &dyn RemoteApi, op: &MutationOp) -> SyncResult<()> {
    match op {
        MutationOp::UpsertActiveOrder {
            table_id,
            session_id,
            lines,
        } => remote.upsert_order(*table_id, session_id, lines).await,

        MutationOp::ClearActiveOrder { table_id } => remote.clear_order(*table_id).await,

        MutationOp::TransferOrder {
            from_table,
            to_table,
            line_ids,
        } => remote.transfer_order(*from_table, *to_table, line_ids).await,

        MutationOp::FinalizeSale {
            table_id,
            session_id,
            display_id,
            operator,
            lines,
            tax,
        } => {
            let payload = FinalizePayload {
                table_id: *table_id,
                session_id: session_id.clone(),
                display_id: display_id.clone(),
                operator: operator.clone(),
                lines: lines.clone(),
                tax: *tax,
            };
            remote.finalize_sale(&payload).await
        }

        MutationOp::RecordSupply {
            item_id,
            quantity,
            total_cost,
            reason,
            operator,
        } => {
            remote
                .record_supply(*item_id, *quantity, *total_cost, reason, operator)
                .await
        }

        MutationOp::RecordWaste {
            item_id,
            quantity,
            reason,
            operator,
        } => remote.record_waste(*item_id, *quantity, reason, operator).await,

        MutationOp::UpsertMenuItem { .. }
        | MutationOp::DeleteMenuItem { .. }
        | MutationOp::UpsertCategory { .. }
        | MutationOp::DeleteCategory { .. }
        | MutationOp::AddUser { .. }
        | MutationOp::DeleteUser { .. } => remote.apply_catalog(op).await,

        MutationOp::SetSetting { key, value } => remote.set_setting(key, value).await,
    }
}

// =============================================================================
// HTTP Remote
// =============================================================================

/// `RemoteApi` over the hub's JSON routes.
pub struct HttpRemote {
    base: Url,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Creates a remote for the given API base URL (e.g. `http://hub:8765`).
    pub fn new(api_url: &str) -> SyncResult<Self> {
        let base = Url::parse(api_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        Ok(HttpRemote { base, client })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        kind: &str,
        body: &T,
    ) -> SyncResult<reqwest::Response> {
        let endpoint = self.base.join(path)?;
        debug!(%endpoint, kind, "Replaying mutation");
        Ok(self.client.post(endpoint).json(body).send().await?)
    }

    /// Maps a non-2xx reply onto queue error semantics.
    ///
    /// A bodiless 404 (or an explicit 501) means the route itself does not
    /// exist on this remote; application-level not-found replies carry a
    /// JSON body and keep their status.
    async fn check(kind: &str, response: reqwest::Response) -> SyncResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_IMPLEMENTED
            || (status == StatusCode::NOT_FOUND && message.is_empty())
        {
            return Err(SyncError::RemoteUnsupported { kind: kind.into() });
        }
        Err(SyncError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpsertOrderBody<'a> {
    table_id: i64,
    session_id: &'a SessionId,
    lines: &'a [OrderLine],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearOrderBody {
    table_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferBody<'a> {
    from_table: i64,
    to_table: i64,
    line_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SupplyBody<'a> {
    item_id: i64,
    quantity: i64,
    total_cost: Money,
    reason: &'a str,
    operator: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WasteBody<'a> {
    item_id: i64,
    quantity: i64,
    reason: &'a str,
    operator: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingBody<'a> {
    key: &'a str,
    value: &'a str,
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn upsert_order(
        &self,
        table_id: i64,
        session_id: &SessionId,
        lines: &[OrderLine],
    ) -> SyncResult<()> {
        let response = self
            .post(
                "/api/orders/upsert",
                "upsert_active_order",
                &UpsertOrderBody {
                    table_id,
                    session_id,
                    lines,
                },
            )
            .await?;
        Self::check("upsert_active_order", response).await
    }

    async fn clear_order(&self, table_id: i64) -> SyncResult<()> {
        let response = self
            .post(
                "/api/orders/clear",
                "clear_active_order",
                &ClearOrderBody { table_id },
            )
            .await?;
        Self::check("clear_active_order", response).await
    }

    async fn transfer_order(
        &self,
        from_table: i64,
        to_table: i64,
        line_ids: &[String],
    ) -> SyncResult<()> {
        let response = self
            .post(
                "/api/orders/transfer",
                "transfer_order",
                &TransferBody {
                    from_table,
                    to_table,
                    line_ids,
                },
            )
            .await?;
        Self::check("transfer_order", response).await
    }

    async fn finalize_sale(&self, payload: &FinalizePayload) -> SyncResult<()> {
        let response = self
            .post("/api/sales/finalize", "finalize_sale", payload)
            .await?;

        // Duplicate session id: the sale already exists server-side, so
        // the queued intent is satisfied.
        if response.status() == StatusCode::CONFLICT {
            info!(
                session_id = %payload.session_id,
                display_id = %payload.display_id,
                "Sale already paid on remote, treating replay as success"
            );
            return Ok(());
        }
        Self::check("finalize_sale", response).await
    }

    async fn record_supply(
        &self,
        item_id: i64,
        quantity: i64,
        total_cost: Money,
        reason: &str,
        operator: &str,
    ) -> SyncResult<()> {
        let response = self
            .post(
                "/api/stock/supply",
                "record_supply",
                &SupplyBody {
                    item_id,
                    quantity,
                    total_cost,
                    reason,
                    operator,
                },
            )
            .await?;
        Self::check("record_supply", response).await
    }

    async fn record_waste(
        &self,
        item_id: i64,
        quantity: i64,
        reason: &str,
        operator: &str,
    ) -> SyncResult<()> {
        let response = self
            .post(
                "/api/stock/waste",
                "record_waste",
                &WasteBody {
                    item_id,
                    quantity,
                    reason,
                    operator,
                },
            )
            .await?;
        Self::check("record_waste", response).await
    }

    async fn apply_catalog(&self, op: &MutationOp) -> SyncResult<()> {
        let response = self.post("/api/catalog/apply", op.kind(), op).await?;
        Self::check(op.kind(), response).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> SyncResult<()> {
        let response = self
            .post("/api/settings", "set_setting", &SettingBody { key, value })
            .await?;
        Self::check("set_setting", response).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
