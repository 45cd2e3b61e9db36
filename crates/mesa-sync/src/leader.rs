//! # Leader Lease
//!
//! Tracks which connection, if any, currently holds the leader role.
//!
//! ## Why a Lease, Not an Election
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  The hub's own store is authoritative for order state; leadership is    │
//! │  a COMPAT concept for older clients whose protocol generation routed    │
//! │  state through a designated device.                                     │
//! │                                                                         │
//! │  Device A (fixed)  ───► AnnounceLeader ───►  lease = (conn 3, A)        │
//! │  Device A disconnects ─────────────────►     lease = None               │
//! │  Device B (fixed)  ───► AnnounceLeader ───►  lease = (conn 7, B)        │
//! │                                                                         │
//! │  No voting, no terms: the lease changes hands lazily on the next        │
//! │  announce after the holder is gone. Until then RequestState is          │
//! │  answered straight from the store, so nothing stalls on a vacancy.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Leader Info
// =============================================================================

/// The current lease holder.
#[derive(Debug, Clone)]
pub struct LeaderInfo {
    /// Hub-local connection identifier (monotonic per connection).
    pub connection_id: u64,

    /// The device that announced.
    pub device_id: String,

    /// When the lease was acquired.
    pub acquired_at: Instant,
}

// =============================================================================
// Leader Lease
// =============================================================================

/// Shared, concurrency-safe leader reference.
///
/// Cheap to clone; all clones observe the same lease.
#[derive(Debug, Clone, Default)]
pub struct LeaderLease {
    inner: Arc<RwLock<Option<LeaderInfo>>>,
}

impl LeaderLease {
    /// Creates an empty lease.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants the lease to the announcing connection.
    ///
    /// A newer announce always wins: the legacy protocol has no fencing,
    /// so the most recent claimant is by definition the leader.
    pub async fn acquire(&self, connection_id: u64, device_id: &str) {
        let mut slot = self.inner.write().await;
        if let Some(prev) = slot.as_ref() {
            info!(
                previous = %prev.device_id,
                new = %device_id,
                "Leader lease changing hands"
            );
        } else {
            info!(device_id = %device_id, "Leader lease acquired");
        }
        *slot = Some(LeaderInfo {
            connection_id,
            device_id: device_id.to_string(),
            acquired_at: Instant::now(),
        });
    }

    /// Clears the lease if (and only if) the given connection holds it.
    ///
    /// Called on every disconnect; non-holders are a no-op. Returns true
    /// when the lease was actually released.
    pub async fn release_connection(&self, connection_id: u64) -> bool {
        let mut slot = self.inner.write().await;
        match slot.as_ref() {
            Some(holder) if holder.connection_id == connection_id => {
                info!(device_id = %holder.device_id, "Leader lease released");
                *slot = None;
                true
            }
            _ => {
                debug!(connection_id, "Disconnect from non-holder, lease unchanged");
                false
            }
        }
    }

    /// The current holder, if any.
    pub async fn current(&self) -> Option<LeaderInfo> {
        self.inner.read().await.clone()
    }

    /// The current holder's device id, if any.
    pub async fn current_device(&self) -> Option<String> {
        self.inner.read().await.as_ref().map(|l| l.device_id.clone())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_query() {
        let lease = LeaderLease::new();
        assert!(lease.current().await.is_none());

        lease.acquire(3, "register-1").await;
        let holder = lease.current().await.unwrap();
        assert_eq!(holder.connection_id, 3);
        assert_eq!(holder.device_id, "register-1");
    }

    #[tokio::test]
    async fn test_newer_announce_wins() {
        let lease = LeaderLease::new();
        lease.acquire(3, "register-1").await;
        lease.acquire(7, "register-2").await;

        assert_eq!(lease.current_device().await.as_deref(), Some("register-2"));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let lease = LeaderLease::new();
        lease.acquire(3, "register-1").await;

        // Some other connection disconnecting must not clear the lease.
        assert!(!lease.release_connection(99).await);
        assert!(lease.current().await.is_some());

        // The holder disconnecting does.
        assert!(lease.release_connection(3).await);
        assert!(lease.current().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_holder_release_after_handover() {
        let lease = LeaderLease::new();
        lease.acquire(3, "register-1").await;
        lease.acquire(7, "register-2").await;

        // The old holder's late disconnect must not evict the new one.
        assert!(!lease.release_connection(3).await);
        assert_eq!(lease.current_device().await.as_deref(), Some("register-2"));
    }
}
