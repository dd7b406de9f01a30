use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use crate::config::PENDING_LOCK_TTL;
use crate::core::cache::{pending_lock_key, KeyValueStore};
use crate::core::error::LedgerError;

/// Mutual exclusion over a single pending transaction while it is being
/// committed or canceled. Set-if-absent with a TTL; a crashed holder is
/// recovered by expiry.
pub struct PendingLocks {
    store: Arc<dyn KeyValueStore>,
}

impl PendingLocks {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock for a transaction. `None` means another
    /// commit/cancel is already finishing the transition.
    pub async fn acquire(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Option<PendingLockGuard>, LedgerError> {
        let key = pending_lock_key(organization_id, ledger_id, transaction_id);
        let acquired = self
            .store
            .set_if_absent(&key, b"locked".to_vec(), PENDING_LOCK_TTL)
            .await?;
        if !acquired {
            debug!("pending lock busy for transaction {}", transaction_id);
            return Ok(None);
        }
        Ok(Some(PendingLockGuard {
            store: self.store.clone(),
            key: Some(key),
        }))
    }
}

/// Releases the lock on drop on every exit path. Prefer the explicit
/// `release` so the removal is awaited in-line.
pub struct PendingLockGuard {
    store: Arc<dyn KeyValueStore>,
    key: Option<String>,
}

impl PendingLockGuard {
    pub async fn release(mut self) -> Result<(), LedgerError> {
        if let Some(key) = self.key.take() {
            self.store.remove(&key).await?;
        }
        Ok(())
    }
}

impl Drop for PendingLockGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let store = self.store.clone();
            // best-effort deferred release; expiry covers a lost race
            tokio::spawn(async move {
                if let Err(e) = store.remove(&key).await {
                    warn!("failed to release pending lock {}: {}", key, e);
                }
            });
        }
    }
}
