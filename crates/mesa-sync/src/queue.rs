//! # Durable Mutation Queue
//!
//! Client-resident FIFO of state-changing operations captured while the
//! server is unreachable, replayed in order once connectivity returns.
//!
//! ## Drain State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Mutation Queue Drain                             │
//! │                                                                         │
//! │            ┌────────┐   try_lock ok    ┌────────────┐                   │
//! │            │  Idle  │ ───────────────► │  Draining  │                   │
//! │            └────────┘                  └──────┬─────┘                   │
//! │                 ▲  try_lock fails             │  per entry, FIFO:       │
//! │                 │  (AlreadyDraining)          │                         │
//! │                 │                             ▼                         │
//! │                 │            ┌──────────────────────────────────┐       │
//! │                 │            │ dispatch(remote, op)             │       │
//! │                 │            │   Ok            → remove, next   │       │
//! │                 │            │   Unsupported   → discardable?   │       │
//! │                 │            │                   skip+log : stop│       │
//! │                 │            │   Err           → stop           │       │
//! │                 │            └──────┬──────────────┬────────────┘       │
//! │                 │                   │              │                    │
//! │                 │            all entries done   first failure           │
//! │                 │                   ▼              ▼                    │
//! │                 │            ┌───────────┐  ┌─────────────────────┐     │
//! │                 └─────────── │  Success  │  │ Blocked{entry,error}│     │
//! │                              └───────────┘  └─────────────────────┘     │
//! │                                                                         │
//! │  GUARANTEES:                                                           │
//! │  • At-least-once, in-order delivery. An entry is removed only after   │
//! │    its remote call succeeds; a failure stops the drain so later        │
//! │    entries are never applied ahead of an earlier one.                  │
//! │  • Idempotency is the remote's job (session-id dedup in finalize).    │
//! │  • A drain in progress is never started twice.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use mesa_core::MutationOp;

use crate::error::{SyncError, SyncResult};
use crate::remote::{dispatch, RemoteApi};

// =============================================================================
// Queue Entry
// =============================================================================

/// One durably stored pending operation.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Storage-assigned id; also the FIFO position.
    pub id: i64,

    /// The operation to replay.
    pub op: MutationOp,
}

// =============================================================================
// Queue Store Trait
// =============================================================================

/// Durable substrate for the queue.
///
/// Insertion order is the replay order; `list_in_order` must return
/// entries oldest-first.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends an operation and returns its id.
    async fn append(&self, op: &MutationOp) -> SyncResult<i64>;

    /// All pending entries, oldest first.
    async fn list_in_order(&self) -> SyncResult<Vec<QueueEntry>>;

    /// Removes an entry by id. Removing a missing id is a no-op.
    async fn remove(&self, id: i64) -> SyncResult<()>;
}

// =============================================================================
// SQLite Queue Store
// =============================================================================

const CREATE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS mutation_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    op_json     TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

/// Queue persistence over a client-local SQLite database.
///
/// Creates its own table; the client database needs no migration step
/// for the queue to work.
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    pub async fn new(pool: SqlitePool) -> SyncResult<Self> {
        sqlx::query(CREATE_QUEUE_TABLE).execute(&pool).await?;
        Ok(SqliteQueueStore { pool })
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn append(&self, op: &MutationOp) -> SyncResult<i64> {
        let op_json = serde_json::to_string(op)?;
        let result = sqlx::query("INSERT INTO mutation_queue (op_json) VALUES (?)")
            .bind(&op_json)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_in_order(&self) -> SyncResult<Vec<QueueEntry>> {
        let rows = sqlx::query("SELECT id, op_json FROM mutation_queue ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let op_json: String = row.get("op_json");
            // A row that no longer parses is a stored-before-downgrade
            // entry; fail loudly rather than replay garbage.
            let op = serde_json::from_str(&op_json).map_err(|e| {
                SyncError::SerializationFailed(format!("queue entry {id}: {e}"))
            })?;
            entries.push(QueueEntry { id, op });
        }
        Ok(entries)
    }

    async fn remove(&self, id: i64) -> SyncResult<()> {
        sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Drain Outcome
// =============================================================================

/// Result of one drain pass.
#[derive(Debug)]
pub enum DrainOutcome {
    /// Another drain already holds the guard; nothing was done.
    AlreadyDraining,

    /// Every pending entry was applied (or skipped as unsupported).
    Success { applied: usize, skipped: usize },

    /// The drain stopped at the first failing entry. The entry stays
    /// queued, as does everything behind it.
    Blocked {
        /// Entries applied before the failure.
        applied: usize,
        /// The entry that failed.
        entry: QueueEntry,
        /// Why it failed.
        error: SyncError,
    },
}

// =============================================================================
// Mutation Queue
// =============================================================================

/// The durable mutation queue.
///
/// `enqueue` never touches the network; `drain` replays against a
/// [`RemoteApi`] under a reentrancy guard.
pub struct MutationQueue {
    store: Arc<dyn QueueStore>,

    /// Held for the duration of a drain; `try_lock` failure means a
    /// drain is already running.
    drain_guard: Mutex<()>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        MutationQueue {
            store,
            drain_guard: Mutex::new(()),
        }
    }

    /// Durably records an operation for later replay.
    pub async fn enqueue(&self, op: MutationOp) -> SyncResult<i64> {
        let id = self.store.append(&op).await?;
        debug!(id, kind = op.kind(), "Mutation queued");
        Ok(id)
    }

    /// Number of pending entries.
    pub async fn pending(&self) -> SyncResult<usize> {
        Ok(self.store.list_in_order().await?.len())
    }

    /// Replays pending entries in FIFO order.
    ///
    /// Stops at the first failure, leaving the failing entry and
    /// everything behind it queued for the next trigger. Operations the
    /// remote reports as unsupported are skipped (and logged) only when
    /// the operation kind is discardable; otherwise they block like any
    /// other failure.
    pub async fn drain(&self, remote: &dyn RemoteApi) -> SyncResult<DrainOutcome> {
        let _guard = match self.drain_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Drain already in progress, skipping");
                return Ok(DrainOutcome::AlreadyDraining);
            }
        };

        let entries = self.store.list_in_order().await?;
        if entries.is_empty() {
            return Ok(DrainOutcome::Success {
                applied: 0,
                skipped: 0,
            });
        }
        info!(pending = entries.len(), "Draining mutation queue");

        let mut applied = 0;
        let mut skipped = 0;
        for entry in entries {
            match dispatch(remote, &entry.op).await {
                Ok(()) => {
                    self.store.remove(entry.id).await?;
                    applied += 1;
                }
                Err(SyncError::RemoteUnsupported { kind }) if entry.op.is_discardable() => {
                    warn!(id = entry.id, kind = %kind, "Remote does not support operation, discarding entry");
                    self.store.remove(entry.id).await?;
                    skipped += 1;
                }
                Err(error) => {
                    warn!(
                        id = entry.id,
                        kind = entry.op.kind(),
                        %error,
                        "Drain blocked, remainder stays queued"
                    );
                    return Ok(DrainOutcome::Blocked {
                        applied,
                        entry,
                        error,
                    });
                }
            }
        }

        info!(applied, skipped, "Mutation queue drained");
        Ok(DrainOutcome::Success { applied, skipped })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
