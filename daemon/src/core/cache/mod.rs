mod memory;

pub use memory::MemoryCache;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BALANCE_KEY_PREFIX, IDEMPOTENCY_KEY_PREFIX, PENDING_LOCK_KEY_PREFIX};
use crate::core::error::LedgerError;

/// Cached funds of one balance. Serialized as JSON with decimals as
/// strings, so the entry round-trips exactly.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedBalance {
    pub available: Decimal,
    pub on_hold: Decimal,
    pub version: u64,
}

/// Outcome of a versioned reserve against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Deltas applied; carries the new version.
    Applied(u64),
    /// The expected version no longer matches; re-read and retry.
    Conflict,
    /// Applying the deltas would overdraw a non-external account.
    Insufficient,
}

/// Versioned mirror of the balance store. The reserve CAS is the
/// linearization point for every balance mutation: two transactions racing
/// on the same balance are serialized here.
#[async_trait]
pub trait BalanceCache: Send + Sync + 'static {
    async fn read(&self, key: &str) -> Result<Option<CachedBalance>, LedgerError>;

    // Populate an entry from the store after a miss. Never downgrades a
    // newer entry.
    async fn warm(&self, key: &str, entry: CachedBalance) -> Result<(), LedgerError>;

    // Atomically verify the version, check the funds and apply both
    // deltas. `allow_overdraft` lifts the available >= 0 constraint for
    // external accounts; on_hold may never go negative.
    async fn reserve(
        &self,
        key: &str,
        delta_available: Decimal,
        delta_on_hold: Decimal,
        expected_version: u64,
        allow_overdraft: bool,
    ) -> Result<ReserveOutcome, LedgerError>;

    // Unconditional write used only by reconciliation paths
    async fn set(&self, key: &str, available: Decimal, on_hold: Decimal)
        -> Result<u64, LedgerError>;

    // Drop an entry so the next reader re-hydrates from the store
    async fn mark_stale(&self, key: &str) -> Result<(), LedgerError>;
}

/// Expiring key/value side of the cache, backing the pending lock and the
/// idempotency keeper.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    // Insert only if the key is absent. Returns whether the insert won.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, LedgerError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), LedgerError>;

    async fn remove(&self, key: &str) -> Result<(), LedgerError>;
}

pub fn balance_cache_key(
    organization_id: &Uuid,
    ledger_id: &Uuid,
    alias: &str,
    balance_key: &str,
) -> String {
    format!(
        "{}:{}:{}:{}#{}",
        BALANCE_KEY_PREFIX, organization_id, ledger_id, alias, balance_key
    )
}

pub fn pending_lock_key(
    organization_id: &Uuid,
    ledger_id: &Uuid,
    transaction_id: &Uuid,
) -> String {
    format!(
        "{}:{}:{}:{}",
        PENDING_LOCK_KEY_PREFIX, organization_id, ledger_id, transaction_id
    )
}

pub fn idempotency_cache_key(organization_id: &Uuid, ledger_id: &Uuid, key: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        IDEMPOTENCY_KEY_PREFIX, organization_id, ledger_id, key
    )
}
